use std::collections::BTreeMap;
use std::path::Path;

use cli_table::{Cell, CellStruct, Style, Table, format::Justify, print_stdout};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

const SCHEMA_VERSION: u32 = 1;

pub const fn get_schema_version() -> u32 {
    SCHEMA_VERSION
}

#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct ServerCollection {
    hosts: BTreeMap<String, Server>,
}

impl ServerCollection {
    pub fn read_from_storage<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        Self::read_from_sqlite(path)
    }

    fn read_from_sqlite<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        use anyhow::Context as _;
        let conn = Connection::open(path).with_context(|| "Failed to open SQLite database")?;
        create_table(&conn)?;

        let mut stmt = conn
            .prepare(
                "SELECT id, alias, username, password, account, address, port, proxy_script,
                        init_commands, list_command, passive_mode, use_tls, last_connect
                 FROM servers",
            )
            .with_context(|| "Failed to prepare statement")?;
        let server_iter = stmt
            .query_map([], |row| {
                let id: i64 = row.get(0)?;
                let alias: String = row.get(1)?;
                let init_commands: Option<String> = row.get(8)?;
                let s = Server {
                    id: Some(id),
                    alias: Some(alias.clone()),
                    username: row.get(2)?,
                    password: row.get(3)?,
                    account: row.get(4)?,
                    address: row.get(5)?,
                    port: row.get(6)?,
                    proxy_script: row.get(7)?,
                    init_commands: init_commands
                        .map(|t| t.split(';').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                        .unwrap_or_default(),
                    list_command: row.get(9)?,
                    passive_mode: row.get(10)?,
                    use_tls: row.get::<_, i64>(11)? != 0,
                    last_connect: row.get(12)?,
                };
                Ok((alias, s))
            })
            .with_context(|| "Failed to query servers")?;

        let mut hosts = BTreeMap::new();
        for server_result in server_iter {
            let (alias, server) = server_result.with_context(|| "Failed to read server row")?;
            hosts.insert(alias, server);
        }

        Ok(ServerCollection { hosts })
    }

    pub fn save_to_storage<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        self.save_to_sqlite(path)
    }

    fn save_to_sqlite<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        use anyhow::Context as _;
        let conn = Connection::open(path).with_context(|| "Failed to open SQLite database")?;
        create_table(&conn)?;

        // 清空现有数据 — Clear existing data
        conn.execute("DELETE FROM servers", []).with_context(|| "Failed to clear table")?;

        let mut stmt = conn
            .prepare(
                "INSERT OR REPLACE INTO servers
                 (alias, username, password, account, address, port, proxy_script,
                  init_commands, list_command, passive_mode, use_tls, last_connect)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )
            .with_context(|| "Failed to prepare insert statement")?;

        for (alias, server) in &self.hosts {
            stmt.execute(params![
                alias,
                server.username,
                server.password,
                server.account,
                server.address,
                server.port as i64,
                server.proxy_script,
                if server.init_commands.is_empty() {
                    None
                } else {
                    Some(server.init_commands.join("; "))
                },
                server.list_command,
                server.passive_mode,
                server.use_tls as i64,
                server.last_connect,
            ])
            .with_context(|| "Failed to insert server")?;
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Server> {
        self.hosts.get(key)
    }

    pub fn insert(&mut self, key: &str, mut server: Server) -> &mut Self {
        // 确保 alias 字段被填充以保持一致性 — Ensure alias field is filled to keep consistency
        if server.alias.is_none() {
            server.alias = Some(key.to_string());
        }
        self.hosts.insert(key.to_owned(), server);
        self
    }

    pub fn remove(&mut self, key: &str) -> &mut Self {
        self.hosts.remove(key);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn hosts(&self) -> &BTreeMap<String, Server> {
        &self.hosts
    }

    pub fn show_table(&self) {
        if !self.is_empty() {
            let title = vec![
                "Alias".cell().bold(true),
                "Username".cell().bold(true),
                "Address".cell().bold(true),
                "Port".cell().bold(true),
                "Mode".cell().bold(true),
                "Last Connect".cell().bold(true),
            ];
            let mut table: Vec<Vec<CellStruct>> = Vec::new();
            for (alias, server) in &self.hosts {
                let mode = match server.passive_mode {
                    Some(0) => "active",
                    Some(_) => "passive",
                    None => "default",
                };
                let col = vec![
                    alias.cell(),
                    server.username.to_string().cell().justify(Justify::Right),
                    server.address.to_string().cell().justify(Justify::Right),
                    server.port.cell().justify(Justify::Right),
                    mode.cell().justify(Justify::Right),
                    server.get_last_connect_display().cell().justify(Justify::Right),
                ];
                table.push(col);
            }
            if let Err(e) = print_stdout(table.table().title(title)) {
                eprintln!("⚠️ 无法渲染表格: {}", e);
            }
        }
    }
}

fn create_table(conn: &Connection) -> anyhow::Result<()> {
    use anyhow::Context as _;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS servers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            alias TEXT UNIQUE NOT NULL,
            username TEXT NOT NULL,
            password TEXT,
            account TEXT,
            address TEXT NOT NULL,
            port INTEGER NOT NULL,
            proxy_script TEXT,
            init_commands TEXT,
            list_command TEXT,
            passive_mode INTEGER,
            use_tls INTEGER NOT NULL DEFAULT 0,
            last_connect TEXT
        )",
        [],
    )
    .with_context(|| "Failed to create table")?;
    Ok(())
}

/// One bookmarked FTP server.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Server {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub alias: Option<String>,
    pub username: String,
    /// Stored in the local bookmark DB; never logged.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub account: Option<String>,
    pub address: String,
    pub port: u16,
    /// Custom login macro for proxied connections.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub proxy_script: Option<String>,
    #[serde(default)]
    pub init_commands: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub list_command: Option<String>,
    /// Per-server passive-mode override: None = config default.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub passive_mode: Option<i64>,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default)]
    pub last_connect: Option<String>,
}

impl Server {
    pub fn get_last_connect_display(&self) -> String {
        match &self.last_connect {
            Some(ts_str) if !ts_str.is_empty() => match ts_str.parse::<i64>() {
                Ok(ts) => {
                    let now = chrono::Local::now().timestamp();
                    let diff = now - ts;
                    if diff < 0 {
                        return "刚刚".to_string();
                    }
                    const MINUTE: i64 = 60;
                    const HOUR: i64 = 60 * MINUTE;
                    const DAY: i64 = 24 * HOUR;

                    if diff < MINUTE {
                        "刚刚".to_string()
                    } else if diff < HOUR {
                        format!("{}分钟前", diff / MINUTE)
                    } else if diff < DAY {
                        format!("{}小时前", diff / HOUR)
                    } else if diff < 2 * DAY {
                        "昨天".to_string()
                    } else if diff < 3 * DAY {
                        "前天".to_string()
                    } else {
                        format!("{}天前", diff / DAY)
                    }
                }
                Err(_) => ts_str.clone(),
            },
            _ => "从未".to_string(),
        }
    }

    pub fn set_last_connect_now(&mut self) {
        let now = chrono::Local::now().timestamp().to_string();
        self.last_connect = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_db_path() -> std::path::PathBuf {
        let now_ns = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("fp_server_test_{}_{}.db", std::process::id(), now_ns))
    }

    #[test]
    fn round_trip_through_sqlite() {
        let db = unique_db_path();
        let mut collection = ServerCollection::default();
        collection.insert(
            "box",
            Server {
                username: "joe".into(),
                password: Some("pw".into()),
                address: "ftp.example.com".into(),
                port: 2121,
                init_commands: vec!["SITE IDLE 300".into()],
                use_tls: true,
                ..Server::default()
            },
        );
        collection.save_to_storage(&db).unwrap();
        let back = ServerCollection::read_from_storage(&db).unwrap();
        let server = back.get("box").unwrap();
        assert_eq!(server.username, "joe");
        assert_eq!(server.port, 2121);
        assert_eq!(server.init_commands, vec!["SITE IDLE 300".to_string()]);
        assert!(server.use_tls);
        let _ = std::fs::remove_file(&db);
    }

    #[test]
    fn insert_fills_alias() {
        let mut collection = ServerCollection::default();
        collection.insert("mirror", Server::default());
        assert_eq!(collection.get("mirror").unwrap().alias.as_deref(), Some("mirror"));
    }
}
