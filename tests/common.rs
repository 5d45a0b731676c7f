use r2d2::Pool;
use r2d2_postgres::{PostgresConnectionManager, postgres::NoTls as R2d2NoTls};
use uuid::Uuid;

pub const TEST_DB_URL: &str = "CUTOVER_TEST_DB_URL";

pub struct TestDb {
    pub pool: Pool<PostgresConnectionManager<R2d2NoTls>>,
    pub dbname: String,
    admin_url: String,
}

/// Create a fresh database on the server named by `CUTOVER_TEST_DB_URL`.
/// Returns `None` when the variable is unset, so callers can skip.
pub fn setup_test_db() -> Option<TestDb> {
    let Ok(admin_url) = std::env::var(TEST_DB_URL) else {
        eprintln!("{TEST_DB_URL} not set, skipping");
        return None;
    };
    let dbname = format!("cutover_test_{}", Uuid::new_v4().simple());
    let mut admin_client = postgres::Client::connect(&admin_url, postgres::NoTls).unwrap();
    admin_client
        .simple_query(&format!("CREATE DATABASE {dbname}"))
        .unwrap();

    let mut config: postgres::Config = admin_url.parse().unwrap();
    config.dbname(&dbname);
    let manager = PostgresConnectionManager::new(config, R2d2NoTls);
    let pool = Pool::builder().max_size(3).build(manager).unwrap();
    Some(TestDb {
        pool,
        dbname,
        admin_url,
    })
}

impl TestDb {
    #[allow(dead_code)]
    pub fn get_client(
        &self,
    ) -> r2d2::PooledConnection<PostgresConnectionManager<R2d2NoTls>> {
        self.pool.get().unwrap()
    }
}

impl Drop for TestDb {
    fn drop(&mut self) {
        let Ok(mut admin_client) = postgres::Client::connect(&self.admin_url, postgres::NoTls)
        else {
            return;
        };
        let terminate_sql = format!(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = '{}' AND pid <> pg_backend_pid()",
            self.dbname
        );
        let _ = admin_client.simple_query(&terminate_sql);
        let _ = admin_client.simple_query(&format!("DROP DATABASE IF EXISTS {}", self.dbname));
    }
}
