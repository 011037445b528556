use actix_web::{middleware, web, App, HttpServer};
use clap::Parser;
use log::{error, info};
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Root};
use log4rs::encode::pattern::PatternEncoder;

use open_saves::api;
use open_saves::app_state::AppState;
use open_saves::config::{AppConfig, Cli, DEFAULT_CONFIG_PARAMETER};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_config);

    let source = cli
        .config
        .unwrap_or_else(|| DEFAULT_CONFIG_PARAMETER.to_string());
    let config = match AppConfig::load(&source).await {
        Ok(config) => config,
        Err(err) => {
            error!("configuration load failed from {}: {}", source, err);
            std::process::exit(1);
        }
    };

    let state = match AppState::from_config(config.clone()).await {
        Ok(state) => state,
        Err(err) => {
            error!("backend bootstrap failed: {}", err);
            std::process::exit(1);
        }
    };

    let grpc_addr = match format!("{}:{}", config.server.host, config.server.grpc_port).parse() {
        Ok(addr) => addr,
        Err(err) => {
            error!("bad grpc bind address: {}", err);
            std::process::exit(1);
        }
    };
    let grpc_state = state.clone();
    tokio::spawn(async move {
        info!("starting grpc server on {}", grpc_addr);
        if let Err(err) = open_saves::grpc::serve(grpc_state, grpc_addr).await {
            error!("grpc server exited: {}", err);
        }
    });

    info!(
        "starting http server on {}:{}",
        config.server.host, config.server.http_port
    );
    let app_state = web::Data::new(state);
    let payload_limit = config.server.max_payload_size as usize;
    HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .app_data(app_state.clone())
            .app_data(web::PayloadConfig::default().limit(payload_limit))
            .configure(api::configure)
    })
    .workers(config.server.workers)
    .bind((config.server.host.as_str(), config.server.http_port))?
    .run()
    .await
}

fn init_logging(path: &str) {
    if std::path::Path::new(path).exists()
        && log4rs::init_file(path, Default::default()).is_ok()
    {
        return;
    }
    // Console fallback when no log configuration file ships beside the
    // binary.
    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "{d(%Y-%m-%d %H:%M:%S)} {h({l})} {t} {m}{n}",
        )))
        .build();
    if let Ok(config) = log4rs::Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(log::LevelFilter::Info))
    {
        let _ = log4rs::init_config(config);
    }
}
