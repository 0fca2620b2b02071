use dotenv::dotenv;
use lazy_static::lazy_static;
use livepoll_server::db::{self, PgStore};
use sqlx::{postgres::PgConnectOptions, PgPool};
use tokio::sync::Mutex;
use tracing::{debug, span};

lazy_static! {
    static ref CREATE_DB_MUTEX: Mutex<()> = Mutex::new(());
}

async fn create_test_db(pool: &PgPool, test_db: &str) {
    let _lock = CREATE_DB_MUTEX.lock().await;
    debug!("Creating new test db");

    sqlx::query(&format!("DROP DATABASE IF EXISTS {}", test_db))
        .execute(pool)
        .await
        .unwrap();
    sqlx::query(&format!("CREATE DATABASE {}", test_db))
        .execute(pool)
        .await
        .unwrap();
}

async fn drop_test_db(pool: &PgPool, test_db: &str) {
    debug!("Dropping test db");
    sqlx::query(&format!("DROP DATABASE IF EXISTS {} WITH (FORCE)", test_db))
        .execute(pool)
        .await
        .unwrap();
}

/// Throwaway, migrated database cloned from `DATABASE_URL`.
pub struct IntegrationTestDb {
    db_name: String,
    store: PgStore,
    template_connect_options: PgConnectOptions,
}

impl IntegrationTestDb {
    /// `None` when no database is configured, so callers can skip.
    pub async fn new() -> Option<Self> {
        dotenv().ok();
        let template_connect_options: PgConnectOptions =
            std::env::var("DATABASE_URL").ok()?.parse().unwrap();

        let db_name = format!("integration_{}", uuid::Uuid::new_v4().simple());
        let span = span!(tracing::Level::DEBUG, "test_db", test_db = db_name.as_str());
        let _enter = span.enter();
        let template_pool = db::new_pool_with(template_connect_options.clone(), 1)
            .await
            .unwrap();
        create_test_db(&template_pool, &db_name).await;

        let options = template_connect_options.clone().database(&db_name);
        let store = PgStore(db::new_pool_with(options, 5).await.unwrap());
        store.migrate().await.unwrap();

        Some(Self {
            db_name,
            store,
            template_connect_options,
        })
    }

    pub fn store(&self) -> PgStore {
        PgStore(self.store.pool())
    }
}

impl Drop for IntegrationTestDb {
    fn drop(&mut self) {
        let db_name = self.db_name.clone();
        let template_connect_options = self.template_connect_options.clone();
        // The test's runtime is going away, so drop the database from a
        // system of its own.
        let cleanup = std::thread::spawn(move || {
            actix_rt::System::new().block_on(async move {
                let template_pool = db::new_pool_with(template_connect_options, 1)
                    .await
                    .unwrap();
                drop_test_db(&template_pool, &db_name).await;
                debug!(test_db = db_name.as_str(), "Dropped test db");
            });
        });
        let _ = cleanup.join();
    }
}
