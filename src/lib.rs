pub mod auth;
pub mod db;
pub mod error;
pub mod models;
pub mod request_logger;
pub mod routes;

use crate::auth::memory::InMemoryIdentityStore;
use crate::auth::refresh_store::run_cleanup_loop;
use crate::auth::{AuthConfig, AuthState, PgIdentityStore, PgRefreshTokenLedger, ProviderRegistry};
use crate::db::CodekataDb;
use crate::request_logger::RequestLogger;
use env_logger::Env;
use rocket::fairing::AdHoc;
use rocket::http::Method;
use rocket::{Build, Catcher, Rocket, Route, catch, catchers, routes};
use rocket_cors::{AllowedOrigins, CorsOptions};
use rocket_db_pools::Database;
use std::sync::{Arc, Once};
use std::time::Duration;

static LOGGER: Once = Once::new();

fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(
            Env::default().default_filter_or("info,rocket::server=warn,rocket::request=warn"),
        )
        .init();
    });
}

#[catch(401)]
fn unauthorized() -> &'static str {
    "unauthorized"
}

#[catch(403)]
fn forbidden() -> &'static str {
    "forbidden"
}

/// Plain-text bodies for gate rejections.
pub fn auth_catchers() -> Vec<Catcher> {
    catchers![unauthorized, forbidden]
}

/// Every route served under `/api`.
pub fn api_routes() -> Vec<Route> {
    routes![
        // Session routes
        auth::routes::login,
        auth::routes::refresh,
        auth::routes::logout,
        auth::routes::logout_everywhere,
        // User routes
        routes::users::current_user,
        routes::users::set_admin,
        // Public routes
        routes::providers::list_providers,
        routes::health::ping,
    ]
}

fn allowed_origins() -> AllowedOrigins {
    match std::env::var("CODEKATA_ALLOWED_ORIGINS") {
        Ok(raw) if !raw.trim().is_empty() => {
            let origins: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(str::to_string)
                .collect();
            AllowedOrigins::some_exact(&origins)
        }
        _ => AllowedOrigins::all(),
    }
}

pub fn rocket() -> Rocket<Build> {
    init_logger();

    let cors = CorsOptions::default()
        .allowed_origins(allowed_origins())
        .allowed_methods(
            vec![Method::Get, Method::Post, Method::Put, Method::Delete]
                .into_iter()
                .map(From::from)
                .collect(),
        )
        .allow_credentials(true)
        .to_cors();

    let mut rocket = rocket::build()
        .attach(RequestLogger)
        .attach(CodekataDb::init());

    match cors {
        Ok(cors) => rocket = rocket.attach(cors),
        Err(err) => log::error!("invalid CORS configuration, CORS disabled: {}", err),
    }

    rocket
        // Run database migrations on startup
        .attach(AdHoc::try_on_ignite(
            "Run Migrations",
            |rocket| async move {
                match CodekataDb::fetch(&rocket) {
                    Some(db) => match db::run_migrations(db).await {
                        Ok(_) => {
                            log::info!("database migrations successful");
                            Ok(rocket)
                        }
                        Err(e) => {
                            log::error!("database migrations failed: {}", e);
                            Err(rocket)
                        }
                    },
                    None => {
                        log::error!("database pool not available for migrations");
                        Err(rocket)
                    }
                }
            },
        ))
        .attach(AdHoc::try_on_ignite("Auth State", |rocket| async move {
            let config = match AuthConfig::from_env() {
                Ok(config) => config,
                Err(err) => {
                    log::error!("invalid auth configuration: {}", err);
                    return Err(rocket);
                }
            };
            let providers = match ProviderRegistry::from_env() {
                Ok(providers) => providers,
                Err(err) => {
                    log::error!("failed to initialise identity providers: {}", err);
                    return Err(rocket);
                }
            };
            if providers.is_empty() {
                log::warn!("no identity providers configured; login is unavailable");
            }

            let Some(db) = CodekataDb::fetch(&rocket) else {
                log::error!("database pool not available for auth state");
                return Err(rocket);
            };
            let pool = (**db).clone();

            log::info!("auth configured: {:?}", config);
            let state = AuthState::new(
                config,
                Arc::new(PgRefreshTokenLedger::new(pool.clone())),
                Arc::new(PgIdentityStore::new(pool)),
                providers,
            );
            Ok(rocket.manage(state))
        }))
        .attach(AdHoc::on_liftoff("Spawn Ledger Cleanup", |rocket| {
            Box::pin(async move {
                let Some(state) = rocket.state::<AuthState>() else {
                    log::error!("failed to spawn ledger cleanup: auth state not found");
                    return;
                };
                if state.config.ledger_cleanup_secs == 0 {
                    log::info!("ledger cleanup disabled");
                    return;
                }

                let period = Duration::from_secs(state.config.ledger_cleanup_secs);
                let ledger = state.ledger.clone();
                tokio::spawn(async move {
                    log::info!("starting ledger cleanup every {:?}", period);
                    run_cleanup_loop(ledger, period).await
                });
            })
        }))
        .mount("/api", api_routes())
        .register("/", auth_catchers())
}

/// In-memory auth state for embedding and tests; nothing is persisted.
pub fn in_memory_auth_state(config: AuthConfig, providers: ProviderRegistry) -> AuthState {
    AuthState::new(
        config,
        Arc::new(auth::memory::InMemoryRefreshTokenLedger::new()),
        Arc::new(InMemoryIdentityStore::new()),
        providers,
    )
}

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support {
    use std::sync::Arc;

    use rocket::config::LogLevel;
    use rocket::figment::Figment;
    use rocket::local::asynchronous::Client as AsyncClient;
    use rocket::local::blocking::Client;
    use rocket::{Build, Catcher, Rocket, Route};

    use crate::auth::providers::{IdentityProvider, ProviderDescriptor, ProviderProfile, YANDEX};
    use crate::auth::{AuthConfig, AuthResult, AuthState, ProviderRegistry};

    pub use database::{TestDatabase, TestDatabaseError};

    pub const TEST_ACCESS_SECRET: &str = "test-access-secret-0123456789abcdef";
    pub const TEST_REFRESH_SECRET: &str = "test-refresh-secret-0123456789abcdef";

    /// Config with distinct test secrets and default lifetimes.
    pub fn test_auth_config() -> AuthConfig {
        AuthConfig::from_lookup(|key| match key {
            "CODEKATA_ACCESS_TOKEN_SECRET" => Some(TEST_ACCESS_SECRET.to_string()),
            "CODEKATA_REFRESH_TOKEN_SECRET" => Some(TEST_REFRESH_SECRET.to_string()),
            "CODEKATA_COOKIE_SECURE" => Some("false".to_string()),
            "CODEKATA_REVOKE_ON_LOGOUT" => Some("true".to_string()),
            _ => None,
        })
        .expect("test auth config is valid")
    }

    /// Identity provider that accepts any non-empty code and always resolves
    /// to the same account.
    pub struct StubProvider {
        provider_user_id: String,
    }

    impl StubProvider {
        pub fn new(provider_user_id: impl Into<String>) -> Self {
            Self {
                provider_user_id: provider_user_id.into(),
            }
        }

        /// Registry with a single stub registered under the `yandex` key.
        pub fn registry(provider_user_id: &str) -> ProviderRegistry {
            ProviderRegistry::new().with_provider(YANDEX, Arc::new(Self::new(provider_user_id)))
        }
    }

    #[rocket::async_trait]
    impl IdentityProvider for StubProvider {
        async fn resolve_profile(&self, authorization_code: &str) -> AuthResult<ProviderProfile> {
            if authorization_code == "rejected" {
                return Err(crate::auth::AuthError::ProviderRejected(
                    "invalid_grant".into(),
                ));
            }
            Ok(ProviderProfile {
                provider_user_id: self.provider_user_id.clone(),
                email: Some(format!("{}@example.test", self.provider_user_id)),
                display_name: format!("User {}", self.provider_user_id),
                avatar_url: None,
                provider_name: YANDEX.to_string(),
            })
        }

        fn descriptor(&self) -> ProviderDescriptor {
            ProviderDescriptor {
                provider: YANDEX.to_string(),
                client_id: "stub-client".to_string(),
                auth_url: "https://oauth.example.test/authorize".to_string(),
                redirect_uri: "http://localhost:3000/YandexAuthCallback".to_string(),
                scopes: vec!["login:info".to_string()],
            }
        }
    }

    pub mod database {
        use log::LevelFilter;
        use rocket_db_pools::sqlx::postgres::{PgConnectOptions, PgPoolOptions};
        use rocket_db_pools::sqlx::{self, ConnectOptions, PgPool};
        use testcontainers::{
            ContainerAsync, ImageExt, core::error::TestcontainersError, runners::AsyncRunner,
        };
        use testcontainers_modules::postgres::Postgres;
        use thiserror::Error;
        use tokio::runtime::Handle;
        use uuid::Uuid;

        use crate::db::MIGRATOR;

        #[derive(Debug, Error)]
        pub enum TestDatabaseError {
            #[error("TEST_DATABASE_URL not set and TEST_DATABASE_CONTAINER disabled")]
            MissingUrl,
            #[error("database error: {0}")]
            Sqlx(#[from] sqlx::Error),
            #[error("migration error: {0}")]
            Migration(#[from] sqlx::migrate::MigrateError),
            #[error("container error: {0}")]
            Container(#[from] TestcontainersError),
        }

        /// Ephemeral, migrated database for integration tests.
        pub struct TestDatabase {
            pool: Option<PgPool>,
            admin_options: PgConnectOptions,
            database_name: String,
            container: Option<ContainerAsync<Postgres>>,
        }

        impl TestDatabase {
            /// Create a fresh database on the server named by `TEST_DATABASE_URL`,
            /// or in a disposable Postgres container when
            /// `TEST_DATABASE_CONTAINER=1`.
            pub async fn new_from_env() -> Result<Self, TestDatabaseError> {
                if let Ok(url) = std::env::var("TEST_DATABASE_URL") {
                    return Self::provision(&url, None).await;
                }
                if std::env::var("TEST_DATABASE_CONTAINER").as_deref() == Ok("1") {
                    return Self::new_in_container().await;
                }
                Err(TestDatabaseError::MissingUrl)
            }

            async fn new_in_container() -> Result<Self, TestDatabaseError> {
                let container = Postgres::default().with_tag("16-alpine").start().await?;
                let host = container.get_host().await?.to_string();
                let port = container.get_host_port_ipv4(5432).await?;
                let admin_url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);
                Self::provision(&admin_url, Some(container)).await
            }

            async fn provision(
                admin_url: &str,
                container: Option<ContainerAsync<Postgres>>,
            ) -> Result<Self, TestDatabaseError> {
                let base_options: PgConnectOptions = admin_url.parse()?;
                let base_options = base_options.log_statements(LevelFilter::Off);

                let base_name = base_options
                    .get_database()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "postgres".to_string());

                let admin_options = base_options.clone().database("postgres");
                let admin_pool = PgPoolOptions::new()
                    .max_connections(1)
                    .connect_with(admin_options.clone())
                    .await?;

                let new_db_name = format!("{}_{}", base_name, Uuid::new_v4().simple());
                let create_sql = format!("CREATE DATABASE \"{}\" TEMPLATE template0", new_db_name);
                sqlx::query(&create_sql).execute(&admin_pool).await?;
                admin_pool.close().await;

                let pool = PgPoolOptions::new()
                    .max_connections(20)
                    .connect_with(base_options.clone().database(&new_db_name))
                    .await?;

                MIGRATOR.run(&pool).await?;

                Ok(Self {
                    pool: Some(pool),
                    admin_options,
                    database_name: new_db_name,
                    container,
                })
            }

            pub fn pool(&self) -> &PgPool {
                self.pool.as_ref().expect("test database pool is available")
            }

            pub fn pool_clone(&self) -> PgPool {
                self.pool().clone()
            }

            /// Close pool connections and drop the ephemeral database.
            pub async fn close(mut self) -> Result<(), TestDatabaseError> {
                if let Some(pool) = self.pool.take() {
                    pool.close().await;
                }

                drop_database_with_fallback(self.admin_options.clone(), &self.database_name)
                    .await?;

                if let Some(container) = self.container.take() {
                    drop(container);
                }

                Ok(())
            }
        }

        async fn drop_database_with_fallback(
            admin_options: PgConnectOptions,
            database_name: &str,
        ) -> Result<(), sqlx::Error> {
            let admin_pool = PgPoolOptions::new()
                .max_connections(1)
                .connect_with(admin_options)
                .await?;

            let drop_force = format!("DROP DATABASE \"{}\" WITH (FORCE)", database_name);
            match sqlx::query(&drop_force).execute(&admin_pool).await {
                Ok(_) => Ok(()),
                Err(err) if force_drop_unsupported(&err) => {
                    let drop_sql = format!("DROP DATABASE \"{}\"", database_name);
                    sqlx::query(&drop_sql).execute(&admin_pool).await?;
                    Ok(())
                }
                Err(err) => Err(err),
            }
        }

        fn force_drop_unsupported(err: &sqlx::Error) -> bool {
            matches!(
                err,
                sqlx::Error::Database(db_err)
                    if db_err
                        .code()
                        .map(|code| code == "42601" || code == "0A000")
                        .unwrap_or(false)
            )
        }

        impl Drop for TestDatabase {
            fn drop(&mut self) {
                if let Some(pool) = self.pool.take() {
                    let admin_options = self.admin_options.clone();
                    let db_name = self.database_name.clone();
                    if let Ok(handle) = Handle::try_current() {
                        handle.spawn(async move {
                            pool.close().await;
                            let _ = drop_database_with_fallback(admin_options, &db_name).await;
                        });
                    } else {
                        std::thread::spawn(move || {
                            if let Ok(rt) = tokio::runtime::Runtime::new() {
                                rt.block_on(async move {
                                    pool.close().await;
                                    let _ = drop_database_with_fallback(admin_options, &db_name)
                                        .await;
                                });
                            }
                        });
                    }
                }

                if let Some(container) = self.container.take() {
                    drop(container);
                }
            }
        }
    }

    /// Builder for constructing Rocket instances tailored for integration tests.
    #[derive(Default)]
    pub struct TestRocketBuilder {
        figment: Figment,
        mounts: Vec<(String, Vec<Route>)>,
        catchers: Vec<Catcher>,
        auth_state: Option<AuthState>,
    }

    impl TestRocketBuilder {
        /// Start a builder with sensible defaults: random port, logging disabled.
        pub fn new() -> Self {
            let figment = rocket::Config::figment()
                .merge(("port", 0))
                .merge(("log_level", LogLevel::Off))
                .merge(("cli_colors", false));

            Self {
                figment,
                mounts: Vec::new(),
                catchers: crate::auth_catchers(),
                auth_state: None,
            }
        }

        /// Mount routes under `/api`.
        pub fn mount_api_routes(mut self, routes: Vec<Route>) -> Self {
            self.mounts.push(("/api".to_string(), routes));
            self
        }

        pub fn manage_auth_state(mut self, state: AuthState) -> Self {
            self.auth_state = Some(state);
            self
        }

        /// Finish building the Rocket instance.
        pub fn build(self) -> Rocket<Build> {
            let mut rocket = rocket::custom(self.figment);

            for (base, routes) in self.mounts {
                rocket = rocket.mount(base, routes);
            }

            if let Some(state) = self.auth_state {
                rocket = rocket.manage(state);
            }

            rocket.register("/", self.catchers)
        }

        /// Convenience helper to produce a blocking local client.
        pub fn blocking_client(self) -> Client {
            Client::tracked(self.build()).expect("valid Rocket instance")
        }

        /// Convenience helper to produce an asynchronous local client.
        pub async fn async_client(self) -> AsyncClient {
            AsyncClient::tracked(self.build())
                .await
                .expect("valid Rocket instance")
        }
    }
}
