//! Allow-list checks applied to every value that ends up on a `docker`
//! command line or in a filesystem path.

use lazy_static::lazy_static;
use regex::Regex;

use crate::{Error, Result};

lazy_static! {
    static ref CONTAINER_NAME: Regex = Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]{0,62}$").unwrap();
    static ref IMAGE_NAME: Regex =
        Regex::new(r"^[a-z0-9][a-z0-9._/-]{0,127}(:[a-zA-Z0-9._-]{1,127})?$").unwrap();
    static ref IMAGE_TAG: Regex = Regex::new(r"^[a-z0-9][a-z0-9_.-]{0,127}$").unwrap();
    static ref EXERCISE_ID: Regex = Regex::new(r"^[a-z0-9][a-z0-9_.-]{0,62}$").unwrap();
}

fn check(pattern: &Regex, what: &'static str, value: &str) -> Result<()> {
    if pattern.is_match(value) && !value.contains("..") {
        Ok(())
    } else {
        Err(Error::InvalidArgument {
            what,
            value: value.to_string(),
        })
    }
}

pub fn container_name(name: &str) -> Result<()> {
    check(&CONTAINER_NAME, "container name", name)
}

pub fn image_name(image: &str) -> Result<()> {
    check(&IMAGE_NAME, "image name", image)
}

/// Tags produced by the orchestrator are a single path component.
pub fn image_tag(tag: &str) -> Result<()> {
    check(&IMAGE_TAG, "image tag", tag)
}

pub fn exercise_id(id: &str) -> Result<()> {
    check(&EXERCISE_ID, "exercise id", id)
}

/// Ports handed to the runtime must be unprivileged.
pub fn host_port(port: u16) -> Result<()> {
    if port >= 1024 {
        Ok(())
    } else {
        Err(Error::InvalidArgument {
            what: "host port",
            value: port.to_string(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn container_names() {
        assert!(container_name("ctf-1a2b3c4d").is_ok());
        assert!(container_name("Sandbox_1.x").is_ok());
        assert!(container_name("").is_err());
        assert!(container_name("-leading-dash").is_err());
        assert!(container_name(&"a".repeat(64)).is_err());
        assert!(container_name("a;rm -rf /").is_err());
        assert!(container_name("$(id)").is_err());
    }

    #[test]
    fn image_names() {
        assert!(image_name("ctf-rev-1").is_ok());
        assert!(image_name("registry.local/ctf/rev-1:v2").is_ok());
        assert!(image_name("Upper").is_err());
        assert!(image_name("ctf/../etc").is_err());
        assert!(image_name("ctf rev").is_err());
        assert!(image_name("ctf:").is_err());
    }

    #[test]
    fn image_tags_are_single_component() {
        assert!(image_tag("ctf-rev-1").is_ok());
        assert!(image_tag("ctf/rev-1").is_err());
        assert!(image_tag("ctf..rev").is_err());
        assert!(image_tag("CTF").is_err());
    }

    #[test]
    fn exercise_ids_reject_traversal() {
        assert!(exercise_id("rev-1").is_ok());
        assert!(exercise_id("web_2.hard").is_ok());
        assert!(exercise_id("..").is_err());
        assert!(exercise_id("../../etc").is_err());
        assert!(exercise_id("a/b").is_err());
        assert!(exercise_id("a\nb").is_err());
    }

    #[test]
    fn privileged_ports_are_rejected() {
        assert!(host_port(22).is_err());
        assert!(host_port(30000).is_ok());
    }
}
