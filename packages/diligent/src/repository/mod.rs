// Repository layer: each domain lives in its own file with `impl Repository`.

use sqlx::sqlite::SqlitePool;

mod messages;
pub(crate) mod users;

#[cfg(test)]
pub(crate) mod test_helpers;

#[derive(Clone)]
pub struct Repository {
    pub(crate) pool: SqlitePool,
}

impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}
