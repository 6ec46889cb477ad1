#![allow(clippy::upper_case_acronyms)]

use std::fs;
use std::process::Command as ProcessCommand;

use clap::{Parser, Subcommand};
use pingora_core::apps::HttpServerOptions;
use pingora_core::listeners::tls::TlsSettings;
use pingora_core::server::configuration::Opt;
use pingora_core::server::Server;
use pingora_proxy::http_proxy_service_with_name;

use edgegate::admin::AdminHttpApp;
use edgegate::config::{Config, Tls};
use edgegate::config::etcd::EtcdConfigSync;
use edgegate::core::status::{mark_ready, ConfigSource};
use edgegate::logging::Logger;
use edgegate::proxy::consumer::load_static_consumers;
use edgegate::proxy::event::ProxyEventHandler;
use edgegate::proxy::{
    global_rule::load_static_global_rules, route::load_static_routes,
    service::load_static_services, ssl::load_static_ssls, upstream::load_upstreams,
};
use edgegate::service::http::HttpService;
use edgegate::service::status::StatusHttpApp;

/// edgegate - an APISIX-style edge gateway built on Pingora.
#[derive(Parser)]
#[command(name = "edgegate", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the gateway. Accepts the same flags as the underlying Pingora
    /// server (`-c/--conf`, `--daemon`, `--test`, `--upgrade`, `--nocapture`).
    Start {
        #[command(flatten)]
        opt: StartOpt,
    },
    /// Gracefully stop a running gateway process, looked up via its pid file.
    Stop {
        #[arg(short, long)]
        conf: String,
    },
    /// Hot-reload a running gateway: starts a new process with `--upgrade`
    /// and signals the old one to hand off its listening sockets.
    Reload {
        #[arg(short, long)]
        conf: String,
    },
    /// Print version information.
    Version,
}

#[derive(Parser)]
struct StartOpt {
    #[arg(short, long)]
    conf: Option<String>,
    #[arg(short, long)]
    daemon: bool,
    #[arg(short, long)]
    test: bool,
    #[arg(short, long)]
    upgrade: bool,
    #[arg(long)]
    nocapture: bool,
}

impl From<StartOpt> for Opt {
    fn from(value: StartOpt) -> Self {
        Opt {
            conf: value.conf,
            daemon: value.daemon,
            test: value.test,
            upgrade: value.upgrade,
            nocapture: value.nocapture,
        }
    }
}

fn pid_from_file(conf_path: &str) -> Option<i32> {
    let config = Config::load_from_yaml(conf_path).ok()?;
    let contents = fs::read_to_string(&config.pingora.pid_file).ok()?;
    contents.trim().parse::<i32>().ok()
}

fn signal_process(conf_path: &str, signal: &str) {
    match pid_from_file(conf_path) {
        Some(pid) => {
            let status = ProcessCommand::new("kill")
                .arg(signal)
                .arg(pid.to_string())
                .status();
            match status {
                Ok(s) if s.success() => log::info!("Sent {signal} to pid {pid}"),
                Ok(s) => log::error!("kill exited with status {s}"),
                Err(e) => log::error!("Failed to invoke kill: {e}"),
            }
        }
        None => log::error!("Could not determine pid from pid file for {conf_path}"),
    }
}

fn main() {
    let cli = Cli::parse();

    let opt = match cli.command {
        Command::Version => {
            println!("edgegate {}", env!("CARGO_PKG_VERSION"));
            return;
        }
        Command::Stop { conf } => {
            env_logger::init();
            signal_process(&conf, "-TERM");
            return;
        }
        Command::Reload { conf } => {
            env_logger::init();
            let exe = std::env::current_exe().expect("Failed to resolve current executable");
            ProcessCommand::new(exe)
                .args(["start", "-c", &conf, "-u"])
                .spawn()
                .expect("Failed to spawn upgraded process");
            signal_process(&conf, "-QUIT");
            return;
        }
        Command::Start { opt } => Opt::from(opt),
    };

    // Load configuration with optional override
    let config = Config::load_yaml_with_opt_override(&opt).expect("Failed to load configuration");

    if let Some(log_cfg) = config.gateway.log.clone() {
        Logger::new(log_cfg).init_env_logger();
    } else {
        env_logger::init();
    }

    // Load upstreams, services and global rules before routes so that a
    // route's upstream_id/service_id lookups resolve at load time.
    log::info!("Loading upstreams...");
    load_upstreams(&config).expect("Failed to load upstreams");

    log::info!("Loading services...");
    load_static_services(&config).expect("Failed to load services");

    log::info!("Loading global rules...");
    load_static_global_rules(&config).expect("Failed to load global rules");

    log::info!("Loading ssls...");
    load_static_ssls(&config).expect("Failed to load ssls");

    log::info!("Loading routes...");
    load_static_routes(&config).expect("Failed to load routes");

    log::info!("Loading consumers...");
    load_static_consumers(&config).expect("Failed to load consumers");

    mark_ready(ConfigSource::Yaml);

    let work_stealing = config.pingora.work_stealing;
    let gateway_cfg = config.gateway.clone();

    // Create Pingora server with optional configuration
    let mut edgegate_server = Server::new_with_opt_and_conf(Some(opt), config.pingora);

    // Create HTTP proxy service with name
    let mut http_service = http_proxy_service_with_name(
        &edgegate_server.configuration,
        HttpService::default(),
        "edgegate",
    );

    // Add listeners from configuration
    log::info!("Adding listeners...");
    for list_cfg in &gateway_cfg.listeners {
        match &list_cfg.tls {
            Some(Tls {
                cert_path,
                key_path,
            }) => {
                let mut settings = TlsSettings::intermediate(cert_path, key_path)
                    .expect("Adding TLS listener shouldn't fail");
                if list_cfg.offer_h2 {
                    settings.enable_h2();
                }
                http_service.add_tls_with_settings(&list_cfg.address.to_string(), None, settings);
            }
            None => {
                if list_cfg.offer_h2c {
                    let http_logic = http_service.app_logic_mut().unwrap();
                    let mut http_server_options = HttpServerOptions::default();
                    http_server_options.h2c = true;
                    http_logic.server_options = Some(http_server_options);
                }
                http_service.add_tcp(&list_cfg.address.to_string());
            }
        }
    }

    // Bootstrapping and server startup
    log::info!("Bootstrapping...");
    edgegate_server.bootstrap();

    log::info!("Bootstrapped. Adding services...");
    edgegate_server.add_service(http_service);

    if let Some(log_cfg) = gateway_cfg.log.clone() {
        edgegate_server.add_service(Logger::new(log_cfg));
    }

    if let Some(status_cfg) = &gateway_cfg.status {
        edgegate_server.add_service(StatusHttpApp::status_http_service(status_cfg));
    }

    if gateway_cfg.admin.is_some() {
        edgegate_server.add_service(AdminHttpApp::admin_http_service(&gateway_cfg));
    }

    if let Some(etcd_cfg) = gateway_cfg.etcd.clone() {
        let handler = Box::new(ProxyEventHandler::new(work_stealing));
        edgegate_server.add_service(EtcdConfigSync::new(etcd_cfg, handler));
        mark_ready(ConfigSource::Etcd);
    }

    log::info!("Starting server...");
    edgegate_server.run_forever();
}
