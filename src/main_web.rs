use anyhow::Context;
use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use scene_forge::web::config::{config_path, load_config};
use scene_forge::web::device::Accelerator;
use scene_forge::web::executor::{SharedExecutor, TaskExecutor};
use scene_forge::web::logger::LOGGER;
use scene_forge::web::mock_backend::{MockBackends, MockFaults};
use scene_forge::web::prompt_queue::PromptQueueEditor;
use scene_forge::web::routes::handle_request;
use scene_forge::web::weights::HfHubFetcher;
use scene_forge::{sys_info, sys_warn};

fn setup_logging() -> anyhow::Result<()> {
    let console = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}",
        )))
        .build();

    let config = Config::builder()
        .appender(Appender::builder().build("console", Box::new(console)))
        .build(Root::builder().appender("console").build(LevelFilter::Info))?;

    log4rs::init_config(config)?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = setup_logging() {
        eprintln!("Failed to set up logging: {e}");
    }

    let config = Arc::new(load_config(&config_path()));
    LOGGER.set_file_logging(!config.disable_file_logging);

    let accelerator = Arc::new(Accelerator::new(
        config.device,
        config.accelerator_capacity_bytes(),
    ));

    // Reference algorithms; weights, snapshots and editing are real.
    let mut backends = MockBackends::new(MockFaults::default()).backends();
    backends.snapshots = Arc::new(HfHubFetcher);
    match PromptQueueEditor::from_config(&config) {
        Ok(Some(editor)) => {
            sys_info!("Image editing enabled via prompt queue");
            backends.editor = Some(Arc::new(editor));
        }
        Ok(None) => {}
        Err(e) => sys_warn!("Image editing disabled: {}", e),
    }

    let executor: SharedExecutor = Arc::new(
        TaskExecutor::new(Arc::clone(&config), accelerator, backends)
            .with_context(|| format!("failed to create {}", config.tmp_dir.display()))?,
    );

    let addr: SocketAddr = config
        .bind_address
        .parse()
        .with_context(|| format!("invalid bind address {}", config.bind_address))?;

    let make_svc = make_service_fn(move |_conn| {
        let executor = Arc::clone(&executor);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                handle_request(req, Arc::clone(&executor))
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .with_context(|| format!("failed to bind {addr}"))?
        .serve(make_svc);

    println!("Scene Forge server starting on http://{addr}");
    println!("Available endpoints:");
    println!("  GET  /                     - API status");
    println!("  GET  /health               - Health check");
    println!("  POST /process              - Submit an image (raw body, image/*)");
    println!("  GET  /status/{{task_id}}     - Task status");
    println!("  GET  /download/{{task_id}}   - Download the textured scene");
    println!("  POST /cancel/{{task_id}}     - Request cancellation");
    println!("  GET  /memory               - Memory usage");
    println!("  POST /cleanup              - Unload all models");

    server.await.context("server error")?;
    Ok(())
}
