//! PostgreSQL client utilities
//!
//! Connections follow one pattern: connect without TLS, drive the connection
//! on a spawned task and hand out the client behind an async mutex.

use anyhow::Result;
use log::error;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};

use sync_core::{SqlError, SyncError};

/// Create a new PostgreSQL client with connection handling
pub async fn new_postgresql_client(connection_string: &str) -> Result<Arc<Mutex<Client>>> {
    Ok(Arc::new(Mutex::new(connect(connection_string).await?)))
}

/// Open a connection that is not shared, for work that holds a transaction open.
pub(crate) async fn connect(connection_string: &str) -> Result<Client> {
    let (client, connection) = tokio_postgres::connect(connection_string, NoTls)
        .await
        .map_err(connect_error)?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("PostgreSQL connection error: {e}");
        }
    });

    Ok(client)
}

fn connect_error(e: tokio_postgres::Error) -> anyhow::Error {
    let message = e.to_string();
    if message.contains("refused") {
        SyncError::ConnectionRefused(message).into()
    } else if message.contains("password authentication failed") {
        SyncError::AuthenticationFailed(message).into()
    } else {
        anyhow::Error::new(e).context("Failed to connect to PostgreSQL")
    }
}

/// Convert a statement failure into [`SyncError::Sql`], keeping the SQLSTATE
/// so the loader can record it on the batch.
pub fn sql_error(e: tokio_postgres::Error) -> anyhow::Error {
    match e.as_db_error() {
        Some(db) => SyncError::Sql(SqlError::new(
            Some(db.code().code().to_string()),
            0,
            db.message(),
        ))
        .into(),
        None => SyncError::Sql(SqlError::new(None, 0, e.to_string())).into(),
    }
}
