use clap::{Parser, Subcommand};
use practice_sandbox::{
    reaper, Config, DockerRuntime, JsonCatalog, LocalStore, Result, SandboxService, Submission,
};
use serde_json::json;
use std::{process, sync::Arc};

#[derive(Parser, Debug)]
#[command(name = "sandboxctl", about = "Operate practice sandboxes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start (or return the running) sandbox for a user and exercise.
    Start { username: String, exercise_id: String },
    /// Show one instance.
    Get { instance_id: String },
    /// Stop an instance and release its ports.
    Stop { instance_id: String },
    /// Ask the runtime for the container state of an instance.
    Status { instance_id: String },
    /// List running instances.
    List,
    /// Stop every running instance of an exercise.
    StopExercise { exercise_id: String },
    /// Stop an exercise's instances and remove its image so it is rebuilt.
    RemoveImage { exercise_id: String },
    /// Submit a flag on behalf of a user.
    Submit {
        username: String,
        exercise_id: String,
        flag: String,
    },
    /// Users with the most solves.
    Leaderboard {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Latest solves, newest first.
    Recent {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Solve statistics of a user.
    UserStats { username: String },
    /// Solve statistics of an exercise.
    ExerciseStats { exercise_id: String },
    /// Run one expiry sweep.
    Reap,
    /// Run the expiry reaper until interrupted.
    Serve,
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();
    if let Err(e) = run(cli.command).await {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}

async fn run(command: Command) -> Result<()> {
    let config = Config::from_env();
    if !config.port_ranges_are_disjoint() {
        log::warn!("Configured port ranges overlap: {:?}", config.port_bases());
    }

    let store = Arc::new(LocalStore::open(&config.state_file)?);
    let catalog = Arc::new(JsonCatalog::load(&config.catalog_file)?);
    let runtime = Arc::new(DockerRuntime::new(&config));
    log::debug!("Loaded {} exercises", catalog.len());

    let service = SandboxService::with_local_store(&config, runtime, store, catalog).await?;

    let output = match command {
        Command::Start {
            username,
            exercise_id,
        } => json!(service.start_environment(&username, &exercise_id).await?),
        Command::Get { instance_id } => json!(service.get_instance(&instance_id).await?),
        Command::Stop { instance_id } => {
            json!({ "stopped": service.stop_environment(&instance_id).await? })
        }
        Command::Status { instance_id } => {
            let status = service
                .orchestrator()
                .container_status(&instance_id)
                .await?;
            json!({ "instance_id": instance_id, "status": status.as_str() })
        }
        Command::List => json!(service.orchestrator().running_instances().await?),
        Command::StopExercise { exercise_id } => {
            let stopped = service
                .orchestrator()
                .stop_all_for_exercise(&exercise_id)
                .await?;
            json!({ "exercise_id": exercise_id, "stopped": stopped })
        }
        Command::RemoveImage { exercise_id } => {
            let stopped = service
                .orchestrator()
                .remove_exercise_image(&exercise_id)
                .await?;
            json!({ "exercise_id": exercise_id, "stopped": stopped, "image_removed": true })
        }
        Command::Leaderboard { limit } => {
            let solves = service.solves();
            json!({
                "top_solvers": solves.top_solvers(limit).await?,
                "most_solved": solves.most_solved_exercises(limit).await?,
            })
        }
        Command::Recent { limit } => json!(service.solves().recent_solves(limit).await?),
        Command::UserStats { username } => json!(service.solves().user_stats(&username).await?),
        Command::ExerciseStats { exercise_id } => {
            json!(service.solves().exercise_stats(&exercise_id).await?)
        }
        Command::Submit {
            username,
            exercise_id,
            flag,
        } => match service
            .submit_flag(&username, &exercise_id, Some(&flag))
            .await?
        {
            Submission::Correct { score } => json!({ "status": "correct", "score": score }),
            Submission::AlreadySolved => json!({ "status": "already_solved" }),
            Submission::Incorrect => json!({ "status": "incorrect" }),
        },
        Command::Reap => {
            let report = reaper::sweep(service.orchestrator(), chrono::Utc::now()).await?;
            json!({
                "expired": report.expired,
                "failed": report.failed,
                "strays": report.strays,
            })
        }
        Command::Serve => {
            log::info!(
                "Reaping expired sandboxes every {} s",
                config.reaper_interval.as_secs()
            );
            let task = reaper::spawn(service.orchestrator().clone(), config.reaper_interval);
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Unable to listen for shutdown signal: {}", e);
            }
            task.abort();
            json!({ "status": "stopped" })
        }
    };

    println!("{}", output);
    Ok(())
}
