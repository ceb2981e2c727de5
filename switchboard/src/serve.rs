use crate::config::{DatabaseConfig, DatabaseCredentials, LogConfig, LogFormat, SwitchboardConfig};
use crate::service::Service;
use miette::{IntoDiagnostic, WrapErr};
use sqlx::postgres::PgConnectOptions;
use sqlx::PgPool;
use std::net::SocketAddr;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use xdg::BaseDirectories;

pub struct AppStateInner {
    pg_pool: PgPool,
    config: SwitchboardConfig,
    service: Arc<Service>,
}
impl AppStateInner {
    pub fn pool(&self) -> &PgPool {
        &self.pg_pool
    }
    pub fn config(&self) -> &SwitchboardConfig {
        &self.config
    }
    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }
}

#[derive(Clone)]
pub struct AppState(Arc<AppStateInner>);
impl AppState {
    pub fn new(pg_pool: PgPool, config: SwitchboardConfig) -> Self {
        let service = Service::new(pg_pool.clone(), config.service.clone());
        AppState(Arc::new(AppStateInner {
            pg_pool,
            config,
            service,
        }))
    }
}
impl Deref for AppState {
    type Target = AppStateInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(clap::Args, Debug)]
pub struct ServeCommand {
    #[arg(short = 'c', long = "config", env = "CORRAL_CFG_FILE")]
    config: Option<PathBuf>,
}

pub async fn pg_pool_from_config(db_config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    // TODO: .ssl_mode(PgSslMode::VerifyFull)
    let pg_options = PgConnectOptions::new()
        .host(&db_config.host)
        .database(&db_config.database)
        .username(&db_config.user);
    let pg_options = match db_config.port {
        None => pg_options,
        Some(port) => pg_options.port(port),
    };
    let pg_options = match &db_config.auth {
        None => pg_options,
        Some(DatabaseCredentials::Password(password)) => pg_options.password(password),
    };
    PgPool::connect_with(pg_options).await
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log.format {
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

/// Load the configuration, set up logging and open a migrated database pool.
async fn prepare(serve_command: &ServeCommand) -> miette::Result<(SwitchboardConfig, PgPool)> {
    let xdg_basedirs = BaseDirectories::with_prefix("corral")
        .into_diagnostic()
        .wrap_err("failed to locate XDG base directories")?;
    let config = super::config::load_configuration(serve_command.config.as_deref(), &xdg_basedirs)?;

    init_tracing(&config.log);

    let pg_pool = pg_pool_from_config(&config.database)
        .await
        .into_diagnostic()
        .wrap_err("failed to connect to database")?;

    // Migrations are embedded in the binary; build.rs rebuilds on changes to ./migrations.
    sqlx::migrate!()
        .run(&pg_pool)
        .await
        .into_diagnostic()
        .wrap_err("failed to migrate database")?;

    Ok((config, pg_pool))
}

/// Run a single backup scheduler pass and exit, for hosts that drive it from cron.
pub async fn schedule_once(serve_command: ServeCommand) -> miette::Result<()> {
    let (config, pg_pool) = prepare(&serve_command).await?;
    let service = Service::new(pg_pool, config.service);
    let report = service
        .run_schedule(chrono::Utc::now())
        .await
        .into_diagnostic()
        .wrap_err("scheduler pass failed")?;
    if report.failures > 0 {
        return Err(miette::miette!(
            "{} VM(s) could not be scheduled, see the log",
            report.failures
        ));
    }
    Ok(())
}

pub async fn serve(serve_command: ServeCommand) -> miette::Result<()> {
    let (config, pg_pool) = prepare(&serve_command).await?;

    let bind_address = config.server.bind_address;
    let tls_config = config.server.testing_only_tls_config.clone();

    let scheduler = config.scheduler.clone();
    let app_state = AppState::new(pg_pool, config);
    if scheduler.enabled {
        let interval = scheduler
            .interval
            .to_std()
            .ok()
            .filter(|interval| !interval.is_zero())
            .ok_or_else(|| miette::miette!("scheduler interval must be positive"))?;
        tracing::info!("Running backup scheduler every {}s", interval.as_secs());
        crate::service::schedule::spawn(app_state.service().clone(), interval);
    }
    let router = super::routes::build_router(app_state);

    enum Server {
        PlainHttp(axum_server::Server),
        Tls(axum_server::Server<axum_server::tls_rustls::RustlsAcceptor>),
    }

    let server = match tls_config {
        None => Server::PlainHttp(axum_server::bind(bind_address)),
        Some(tls) => {
            let rustls_config =
                axum_server::tls_rustls::RustlsConfig::from_pem_file(&tls.cert, &tls.key)
                    .await
                    .into_diagnostic()
                    .wrap_err("Failed to load RusTls configuration for public server")?;
            let server = axum_server::bind_rustls(bind_address, rustls_config);

            tracing::warn!(
                "-- WARNING -- DEVELOPMENT-ONLY TLS MODE IS ENABLED. PLEASE DO NOT USE THIS IN PRODUCTION."
            );

            Server::Tls(server)
        }
    };
    tracing::info!("Bound server to {bind_address}");

    match server {
        Server::PlainHttp(server) => {
            server
                .serve(router.into_make_service_with_connect_info::<SocketAddr>())
                .await
        }
        Server::Tls(server) => {
            server
                .serve(router.into_make_service_with_connect_info::<SocketAddr>())
                .await
        }
    }
    .into_diagnostic()
    .wrap_err("(server exited)")
}
