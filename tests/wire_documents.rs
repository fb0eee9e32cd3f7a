use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Datelike;
use tokio::net::TcpListener;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use orcdesk::tenant::{TenantManager, TenantSettings};
use orcdesk::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir: PathBuf = std::env::temp_dir().join(format!("orcdesk_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(TenantSettings::new(dir)));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "orcdesk".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect_to(addr: SocketAddr, dbname: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(dbname)
        .user("orcdesk")
        .password("orcdesk");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    connect_to(addr, "clinic").await
}

async fn rows(client: &tokio_postgres::Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn column(rows: &[SimpleQueryRow], name: &str) -> Vec<String> {
    rows.iter()
        .map(|r| r.get(name).unwrap_or_default().to_string())
        .collect()
}

fn this_year() -> i32 {
    chrono::Local::now().year()
}

// ── Documents ────────────────────────────────────────────────

#[tokio::test]
async fn issue_quote_returning_number() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let id = Ulid::new();
    let issued = rows(
        &client,
        &format!("INSERT INTO quotes (id, client) VALUES ('{id}', 'Clínica Sorriso') RETURNING *"),
    )
    .await;
    assert_eq!(issued.len(), 1);
    assert_eq!(issued[0].get("id"), Some(id.to_string().as_str()));
    assert_eq!(
        issued[0].get("number"),
        Some(format!("ORC-{}-001", this_year()).as_str())
    );

    let listed = rows(&client, "SELECT * FROM quotes").await;
    assert_eq!(column(&listed, "client"), ["Clínica Sorriso"]);
}

#[tokio::test]
async fn quotes_and_invoices_number_independently() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let year = this_year();

    for _ in 0..2 {
        client
            .batch_execute("INSERT INTO quotes (client) VALUES (NULL)")
            .await
            .unwrap();
    }
    client
        .batch_execute("INSERT INTO invoices (client) VALUES ('Acme')")
        .await
        .unwrap();

    let quotes = rows(&client, &format!("SELECT * FROM quotes WHERE year = {year}")).await;
    assert_eq!(
        column(&quotes, "number"),
        [format!("ORC-{year}-001"), format!("ORC-{year}-002")]
    );
    let invoices = rows(&client, "SELECT * FROM invoices").await;
    assert_eq!(column(&invoices, "number"), [format!("FAT-{year}-001")]);
}

#[tokio::test]
async fn deleted_number_is_not_reissued() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let year = this_year();

    let first = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO invoices (id) VALUES ('{first}')"))
        .await
        .unwrap();
    client
        .batch_execute(&format!("DELETE FROM invoices WHERE id = '{first}'"))
        .await
        .unwrap();

    let next = rows(&client, "INSERT INTO invoices (client) VALUES ('x') RETURNING *").await;
    assert_eq!(column(&next, "number"), [format!("FAT-{year}-002")]);
    assert_eq!(rows(&client, "SELECT * FROM invoices").await.len(), 1);
}

#[tokio::test]
async fn concurrent_connections_get_unique_numbers() {
    let (addr, _tm) = start_test_server().await;

    let mut handles = Vec::new();
    for _ in 0..10 {
        handles.push(tokio::spawn(async move {
            let client = connect(addr).await;
            let mut got = Vec::new();
            for _ in 0..5 {
                let issued =
                    rows(&client, "INSERT INTO quotes (client) VALUES (NULL) RETURNING *").await;
                got.extend(column(&issued, "number"));
            }
            got
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for number in handle.await.unwrap() {
            assert!(seen.insert(number.clone()), "duplicate {number}");
        }
    }
    assert_eq!(seen.len(), 50);
    assert!(seen.contains(&format!("ORC-{}-050", this_year())));
}

#[tokio::test]
async fn next_number_is_a_preview() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;
    let expected = format!("ORC-{}-001", this_year());

    for _ in 0..2 {
        let preview = rows(&client, "SELECT * FROM next_number WHERE kind = 'quote'").await;
        assert_eq!(column(&preview, "number"), [expected.clone()]);
        assert_eq!(column(&preview, "kind"), ["quote"]);
    }
    let issued = rows(&client, "INSERT INTO quotes (client) VALUES (NULL) RETURNING *").await;
    assert_eq!(column(&issued, "number"), [expected]);
}

// ── Calendar ─────────────────────────────────────────────────

#[tokio::test]
async fn busy_slots_over_extended_protocol() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    client
        .batch_execute(&format!(
            "INSERT INTO calendar_events (id, start_date_time, start_date) VALUES \
             ('{}', '2025-03-10T14:30:00-03:00', NULL), \
             ('{}', NULL, '2025-03-10'), \
             ('{}', '2025-03-11T08:00:00-03:00', NULL)",
            Ulid::new(),
            Ulid::new(),
            Ulid::new()
        ))
        .await
        .unwrap();

    let busy = client
        .query("SELECT * FROM busy_slots WHERE date = $1", &[&"2025-03-10"])
        .await
        .unwrap();
    let slots: Vec<String> = busy.iter().map(|r| r.get("slot")).collect();
    assert_eq!(slots, ["02:30 PM", "14:30"]);

    let open = rows(&client, "SELECT * FROM open_slots WHERE date = '2025-03-10'").await;
    let open = column(&open, "slot");
    assert_eq!(open.len(), 15);
    assert!(!open.contains(&"14:30".to_string()));
}

#[tokio::test]
async fn calendar_payload_and_delete() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let id = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO calendar_events (id, payload) VALUES ('{id}', '{{"summary": "Retorno", "start": {{"dateTime": "2025-03-10T09:05:00-03:00"}}}}')"#
        ))
        .await
        .unwrap();

    let busy = rows(&client, "SELECT * FROM busy_slots WHERE date = '2025-03-10'").await;
    assert_eq!(column(&busy, "slot"), ["09:05 AM", "09:05"]);

    let mirror = rows(&client, "SELECT * FROM calendar_events").await;
    assert_eq!(column(&mirror, "id"), [id.to_string()]);

    client
        .batch_execute(&format!("DELETE FROM calendar_events WHERE id = '{id}'"))
        .await
        .unwrap();
    assert!(rows(&client, "SELECT * FROM busy_slots WHERE date = '2025-03-10'")
        .await
        .is_empty());
}

// ── Errors & tenants ─────────────────────────────────────────

#[tokio::test]
async fn errors_carry_sqlstate() {
    let (addr, _tm) = start_test_server().await;
    let client = connect(addr).await;

    let err = client.batch_execute("SELEKT nonsense").await.unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::SYNTAX_ERROR));

    let err = client
        .batch_execute(&format!("DELETE FROM quotes WHERE id = '{}'", Ulid::new()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::RAISE_EXCEPTION));

    let id = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO quotes (id) VALUES ('{id}')"))
        .await
        .unwrap();
    let err = client
        .batch_execute(&format!("INSERT INTO quotes (id) VALUES ('{id}')"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::UNIQUE_VIOLATION));
}

#[tokio::test]
async fn wrong_password_rejected() {
    let (addr, _tm) = start_test_server().await;
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("clinic")
        .user("orcdesk")
        .password("wrong");
    assert!(config.connect(NoTls).await.is_err());
}

#[tokio::test]
async fn tenants_are_isolated() {
    let (addr, _tm) = start_test_server().await;
    let a = connect_to(addr, "clinic_a").await;
    let b = connect_to(addr, "clinic_b").await;

    a.batch_execute("INSERT INTO quotes (client) VALUES (NULL)")
        .await
        .unwrap();
    a.batch_execute("INSERT INTO quotes (client) VALUES (NULL)")
        .await
        .unwrap();

    let issued = rows(&b, "INSERT INTO quotes (client) VALUES (NULL) RETURNING *").await;
    assert_eq!(column(&issued, "number"), [format!("ORC-{}-001", this_year())]);
    assert_eq!(rows(&a, "SELECT * FROM quotes").await.len(), 2);
}
