use std::{process, sync::Arc};

use tagsweep::{
    application::{
        content::ContentClient, downstream::DownstreamCache, error::AppError,
        invalidation::InvalidationService, query::QueryService, repos::AssociationsRepo,
    },
    config,
    infra::{
        db::PostgresRepositories,
        downstream::{HttpRevalidator, MemoryCache},
        error::InfraError,
        http::{self, HttpState},
        management::WebhookRegistrar,
        memory::MemoryAssociations,
        telemetry,
        upstream::HttpContentTransport,
    },
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Migrate(_) => run_migrate(settings).await,
        config::Command::Purge(_) => run_purge(settings).await,
        config::Command::RegisterWebhook(_) => run_register_webhook(settings).await,
    }
}

struct ApplicationContext {
    associations: Arc<dyn AssociationsRepo>,
    cache: Arc<dyn DownstreamCache>,
    invalidation: Arc<InvalidationService>,
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let webhook_token: Arc<str> = settings
        .require_webhook_token()
        .map_err(InfraError::from)?
        .into();

    let app = build_application_context(&settings, true).await?;

    let transport = Arc::new(HttpContentTransport::new(&settings.upstream)?);
    let client = Arc::new(ContentClient::new(
        transport,
        app.associations.clone(),
        app.cache.clone(),
    ));
    let queries = Arc::new(QueryService::new(client, app.cache.clone()));

    let router = http::build_router(HttpState {
        invalidation: app.invalidation,
        queries,
        associations: app.associations,
        webhook_token,
    });

    http::serve(
        settings.server.addr,
        router,
        settings.server.graceful_shutdown,
    )
    .await?;

    info!(target = "tagsweep::serve", "server stopped");
    Ok(())
}

async fn run_migrate(settings: config::Settings) -> Result<(), AppError> {
    let url = require_database_url(&settings)?;
    let pool = PostgresRepositories::connect(url, settings.database.max_connections.get())
        .await
        .map_err(InfraError::from)?;
    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(InfraError::from)?;

    info!(target = "tagsweep::migrate", "migrations applied");
    Ok(())
}

async fn run_purge(settings: config::Settings) -> Result<(), AppError> {
    require_database_url(&settings)?;
    let app = build_application_context(&settings, false).await?;

    let removed = app.invalidation.purge_all().await?;
    info!(
        target = "tagsweep::purge",
        removed_rows = removed,
        "purge complete"
    );
    Ok(())
}

async fn run_register_webhook(settings: config::Settings) -> Result<(), AppError> {
    let webhook_token = settings.require_webhook_token().map_err(InfraError::from)?;
    let public_url = settings.require_public_url().map_err(InfraError::from)?;

    let registrar = WebhookRegistrar::new(&settings.management)?;
    let webhook_id = registrar.register(public_url, webhook_token).await?;

    info!(
        target = "tagsweep::register",
        webhook_id = %webhook_id,
        public_url = %public_url,
        "invalidation webhook registered"
    );
    Ok(())
}

fn require_database_url(settings: &config::Settings) -> Result<&str, AppError> {
    settings.database.url.as_deref().ok_or_else(|| {
        AppError::from(InfraError::configuration(
            "database.url is required for this command",
        ))
    })
}

async fn build_application_context(
    settings: &config::Settings,
    migrate: bool,
) -> Result<ApplicationContext, AppError> {
    let associations: Arc<dyn AssociationsRepo> = match settings.database.url.as_deref() {
        Some(url) => {
            let pool = PostgresRepositories::connect(url, settings.database.max_connections.get())
                .await
                .map_err(InfraError::from)?;
            if migrate {
                PostgresRepositories::run_migrations(&pool)
                    .await
                    .map_err(InfraError::from)?;
            }
            Arc::new(PostgresRepositories::new(pool, settings.database.batch_size))
        }
        None => {
            warn!(
                target = "tagsweep::bootstrap",
                "database.url is not set; associations are kept in memory and lost on restart"
            );
            Arc::new(MemoryAssociations::new())
        }
    };

    let cache: Arc<dyn DownstreamCache> = match settings.downstream.revalidate_url.clone() {
        Some(url) => {
            info!(target = "tagsweep::bootstrap", url = %url, "forwarding invalidations to revalidation endpoint");
            Arc::new(HttpRevalidator::new(url, &settings.downstream)?)
        }
        None => Arc::new(MemoryCache::new(
            settings.downstream.tag_limit,
            settings.downstream.memory_capacity,
        )),
    };

    let invalidation = Arc::new(InvalidationService::new(
        associations.clone(),
        cache.clone(),
        settings.invalidation.concurrency,
    ));

    Ok(ApplicationContext {
        associations,
        cache,
        invalidation,
    })
}
