//! SQLite recording of requests and responses.
//!
//! Hooks enqueue onto a bounded queue and return immediately; a blocking
//! worker owns the connection and drains the queue. A busy database is
//! retried with exponential backoff.

use std::time::Duration;

use async_trait::async_trait;
use rusqlite::Connection;
use tokio::sync::mpsc;

use crate::errors::{Error, Result};
use crate::pipeline::ReadOnlyHook;
use crate::request::Request;
use crate::response::Response;

const QUEUE_CAPACITY: usize = 1024;
const MAX_RETRIES: u32 = 5;

enum DbItem {
  Request(Request),
  Response(Response),
}

/// Read-only hook pair persisting exchanges to a SQLite database.
pub struct SqliteRecorder {
  queue: mpsc::Sender<DbItem>,
}

impl SqliteRecorder {
  /// Open (or create) the database, run the schema, and start the worker.
  pub fn open(path: &str) -> Result<Self> {
    let mut conn = Connection::open(path)?;
    init_schema(&conn)?;

    let (queue, mut rx) = mpsc::channel::<DbItem>(QUEUE_CAPACITY);
    tokio::task::spawn_blocking(move || {
      while let Some(item) = rx.blocking_recv() {
        let result = match &item {
          DbItem::Request(request) => with_retry(|| save_request(&mut conn, request)),
          DbItem::Response(response) => with_retry(|| save_response(&mut conn, response)),
        };
        if let Err(error) = result {
          tracing::error!(%error, "failed to persist exchange to database");
        }
      }
    });

    Ok(Self { queue })
  }

  fn enqueue(&self, item: DbItem) {
    if self.queue.try_send(item).is_err() {
      tracing::warn!("database queue full, dropping item");
    }
  }
}

#[async_trait]
impl ReadOnlyHook<Request> for SqliteRecorder {
  async fn call(&self, request: Request) -> Result<()> {
    self.enqueue(DbItem::Request(request));
    Ok(())
  }
}

#[async_trait]
impl ReadOnlyHook<Response> for SqliteRecorder {
  async fn call(&self, response: Response) -> Result<()> {
    if response.id().is_none() {
      return Err(Error::hook("response without request identifier"));
    }
    self.enqueue(DbItem::Response(response));
    Ok(())
  }
}

fn init_schema(conn: &Connection) -> Result<()> {
  conn.execute_batch(
    r#"
    CREATE TABLE IF NOT EXISTS requests (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        request_id TEXT NOT NULL UNIQUE,
        method TEXT NOT NULL,
        url TEXT NOT NULL,
        body TEXT,
        timestamp DATETIME DEFAULT CURRENT_TIMESTAMP
    );
    CREATE TABLE IF NOT EXISTS responses (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        response_id TEXT NOT NULL,
        status_code INTEGER NOT NULL,
        body TEXT,
        content_length INTEGER
    );
    CREATE TABLE IF NOT EXISTS headers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        request_id TEXT,
        response_id TEXT,
        name TEXT NOT NULL,
        value TEXT NOT NULL,
        FOREIGN KEY (request_id) REFERENCES requests(request_id),
        FOREIGN KEY (response_id) REFERENCES responses(response_id)
    );
    CREATE TABLE IF NOT EXISTS cookies (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        request_id TEXT,
        response_id TEXT,
        name TEXT NOT NULL,
        value TEXT NOT NULL,
        FOREIGN KEY (request_id) REFERENCES requests(request_id),
        FOREIGN KEY (response_id) REFERENCES responses(response_id)
    );
    CREATE INDEX IF NOT EXISTS idx_requests_request_id ON requests (request_id);
    CREATE INDEX IF NOT EXISTS idx_responses_request_id ON responses (response_id);
    CREATE INDEX IF NOT EXISTS idx_requests_url ON requests (url);
    CREATE INDEX IF NOT EXISTS idx_responses_status_code ON responses (status_code);
    CREATE INDEX IF NOT EXISTS idx_headers_name ON headers (name);
    CREATE INDEX IF NOT EXISTS idx_headers_value ON headers (value);
    CREATE INDEX IF NOT EXISTS idx_cookies_name ON cookies (name);
    CREATE INDEX IF NOT EXISTS idx_cookies_value ON cookies (value);
    "#,
  )?;
  Ok(())
}

fn is_busy(error: &rusqlite::Error) -> bool {
  matches!(
    error,
    rusqlite::Error::SqliteFailure(e, _)
      if e.code == rusqlite::ErrorCode::DatabaseBusy
        || e.code == rusqlite::ErrorCode::DatabaseLocked
  )
}

fn with_retry(mut f: impl FnMut() -> Result<()>) -> Result<()> {
  let mut attempt = 0;
  loop {
    match f() {
      Ok(()) => return Ok(()),
      Err(Error::Database(ref e)) if is_busy(e) && attempt + 1 < MAX_RETRIES => {
        tracing::debug!(attempt, "database busy, retrying");
        std::thread::sleep(Duration::from_millis(500 * (1 << attempt)));
        attempt += 1;
      }
      Err(error) => return Err(error),
    }
  }
}

fn save_request(conn: &mut Connection, request: &Request) -> Result<()> {
  let id = request.id().to_string();
  let body = request
    .body()
    .map(|b| String::from_utf8_lossy(b.bytes()).to_string())
    .unwrap_or_default();

  let tx = conn.transaction()?;
  tx.execute(
    "INSERT INTO requests (request_id, method, url, body) VALUES (?1, ?2, ?3, ?4)",
    (&id, request.method().as_str(), &request.uri().to_string(), &body),
  )?;
  let mut has_host = false;
  for (name, value) in request.headers().iter() {
    if name == http::header::HOST {
      has_host = true;
    }
    tx.execute(
      "INSERT INTO headers (request_id, response_id, name, value) VALUES (?1, NULL, ?2, ?3)",
      (&id, name.as_str(), String::from_utf8_lossy(value.as_bytes())),
    )?;
  }
  if !has_host && !request.host().is_empty() {
    tx.execute(
      "INSERT INTO headers (request_id, response_id, name, value) VALUES (?1, NULL, ?2, ?3)",
      (&id, "Host", request.host()),
    )?;
  }
  if let Some(cookie_header) = request.headers().get(http::header::COOKIE) {
    for pair in String::from_utf8_lossy(cookie_header.as_bytes()).split(';') {
      if let Some((name, value)) = pair.trim().split_once('=') {
        tx.execute(
          "INSERT INTO cookies (request_id, response_id, name, value) VALUES (?1, NULL, ?2, ?3)",
          (&id, name, value),
        )?;
      }
    }
  }
  tx.commit()?;
  Ok(())
}

fn save_response(conn: &mut Connection, response: &Response) -> Result<()> {
  let id = response
    .id()
    .map(|id| id.to_string())
    .unwrap_or_else(|| "unknown".to_string());
  let body = response
    .body()
    .map(|b| String::from_utf8_lossy(b.bytes()).to_string())
    .unwrap_or_default();
  let content_length = response
    .content_length()
    .unwrap_or_else(|| body.len() as u64);

  let tx = conn.transaction()?;
  tx.execute(
    "INSERT INTO responses (response_id, status_code, body, content_length) VALUES (?1, ?2, ?3, ?4)",
    (&id, response.status_code().as_u16(), &body, content_length),
  )?;
  for (name, value) in response.headers().iter() {
    tx.execute(
      "INSERT INTO headers (request_id, response_id, name, value) VALUES (NULL, ?1, ?2, ?3)",
      (&id, name.as_str(), String::from_utf8_lossy(value.as_bytes())),
    )?;
  }
  for set_cookie in response.headers().get_all(http::header::SET_COOKIE) {
    let text = String::from_utf8_lossy(set_cookie.as_bytes()).to_string();
    if let Some((name, rest)) = text.split_once('=') {
      let value = rest.split(';').next().unwrap_or(rest);
      tx.execute(
        "INSERT INTO cookies (request_id, response_id, name, value) VALUES (NULL, ?1, ?2, ?3)",
        (&id, name, value),
      )?;
    }
  }
  tx.commit()?;
  Ok(())
}
