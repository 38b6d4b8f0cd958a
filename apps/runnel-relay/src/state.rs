//! Relay-side state: users, machines, scripts, and the command queue.
//!
//! All command lifecycle writes go through this layer. The claim transition
//! is a compare-and-set keyed on the current state so that N concurrent
//! claim attempts resolve to exactly one winner, on both backends: the
//! SQLite path is a single conditional `UPDATE` judged by `rows_affected`,
//! the memory path checks and mutates under one write lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::{distributions::Alphanumeric, Rng};
use sha2::{Digest, Sha256};
use sqlx::{FromRow, SqlitePool};
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use runnel_proto::{
    CommandReport, CommandState, CommandView, MachineStatus, MachineSummary, PendingCommand,
    RegisterMachineResponse, ScriptCreated, UserView,
};

const TIMEOUT_ERROR: &str = "execution timed out before the agent reported a result";

#[derive(Clone)]
pub struct AppState {
    backend: Backend,
    api_token: Option<String>,
    admin_user_id: Option<String>,
    dispatch_timeout: Duration,
    execution_timeout: Duration,
    machine_stale: Duration,
}

#[derive(Clone)]
enum Backend {
    Memory(Arc<InnerState>),
    Sqlite(SqlitePool),
}

struct InnerState {
    tables: RwLock<MemTables>,
}

#[derive(Default)]
struct MemTables {
    users: HashMap<String, UserRecord>,
    machines: HashMap<String, MachineRecord>,
    scripts: HashMap<String, ScriptRecord>,
    commands: BTreeMap<i64, CommandRecord>,
    next_script_id: i64,
    next_command_id: i64,
}

#[derive(Debug, Clone)]
struct UserRecord {
    display_name: Option<String>,
    is_allowed: bool,
    is_admin: bool,
}

#[derive(Debug, Clone)]
struct MachineRecord {
    name: String,
    secret_hash: String,
    registered_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct ScriptRecord {
    script_id: i64,
    content: String,
}

#[derive(Debug, Clone)]
struct CommandRecord {
    script_id: i64,
    target_machine_id: String,
    requested_by: String,
    state: CommandState,
    created_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    output: Option<String>,
    error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("machine not found")]
    MachineNotFound,
    #[error("script not found")]
    ScriptNotFound,
    #[error("command not found")]
    CommandNotFound,
    #[error("script name already registered")]
    ScriptNameTaken,
    #[error("command is not claimable")]
    AlreadyClaimed,
    #[error("command was claimed by a different machine")]
    NotClaimant,
    #[error("command already finished as {0}")]
    CommandFinished(CommandState),
    #[error("machine credentials rejected")]
    Unauthorized,
    #[error("administrator privileges required")]
    Forbidden,
    #[error("corrupt state column: {0}")]
    CorruptState(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Filter for user-facing command listings.
#[derive(Debug, Default, Clone)]
pub struct CommandFilter {
    pub machine_id: Option<String>,
    pub state: Option<CommandState>,
    pub requested_by: Option<String>,
}

/// Counts reported by one watchdog pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepOutcome {
    pub expired: u64,
    pub failed: u64,
}

#[derive(Debug, FromRow)]
struct UserRow {
    display_name: Option<String>,
    is_allowed: i64,
    is_admin: i64,
}

#[derive(Debug, FromRow)]
struct MachineRow {
    machine_id: String,
    name: String,
    registered_at: i64,
    last_seen_at: i64,
}

#[derive(Debug, FromRow)]
struct CommandRow {
    id: i64,
    script_name: String,
    script_content: String,
    target_machine_id: String,
    requested_by: String,
    state: String,
    created_at: i64,
    claimed_at: Option<i64>,
    completed_at: Option<i64>,
    output: Option<String>,
    error: Option<String>,
}

const COMMAND_SELECT: &str = "SELECT c.id, s.name AS script_name, s.content AS script_content, \
     c.target_machine_id, c.requested_by, c.state, c.created_at, c.claimed_at, \
     c.completed_at, c.output, c.error \
     FROM command c JOIN script s ON s.id = c.script_id";

impl AppState {
    /// In-memory state, used by tests and no-database deployments.
    pub fn new() -> Self {
        Self {
            backend: Backend::Memory(Arc::new(InnerState {
                tables: RwLock::new(MemTables::default()),
            })),
            api_token: None,
            admin_user_id: None,
            dispatch_timeout: Duration::seconds(900),
            execution_timeout: Duration::seconds(300),
            machine_stale: Duration::seconds(300),
        }
    }

    pub fn with_db(pool: SqlitePool) -> Self {
        Self {
            backend: Backend::Sqlite(pool),
            ..Self::new()
        }
    }

    pub fn with_api_token(mut self, token: Option<String>) -> Self {
        self.api_token = token;
        self
    }

    pub fn with_admin(mut self, admin_user_id: Option<String>) -> Self {
        self.admin_user_id = admin_user_id;
        self
    }

    pub fn with_timeouts(mut self, dispatch: Duration, execution: Duration, stale: Duration) -> Self {
        self.dispatch_timeout = dispatch;
        self.execution_timeout = execution;
        self.machine_stale = stale;
        self
    }

    pub fn api_token(&self) -> Option<&str> {
        self.api_token.as_deref()
    }

    // ---- users -----------------------------------------------------------

    /// Look up the acting user, creating the row on first sight. The
    /// configured administrator identity is promoted here so the admin can
    /// bootstrap authorization without any pre-existing rows.
    pub async fn ensure_user(
        &self,
        platform_user_id: &str,
        display_name: Option<&str>,
    ) -> Result<UserView, StateError> {
        let is_seed_admin = self.admin_user_id.as_deref() == Some(platform_user_id);
        match &self.backend {
            Backend::Memory(inner) => {
                let mut tables = inner.tables.write().await;
                let rec = tables
                    .users
                    .entry(platform_user_id.to_string())
                    .or_insert_with(|| UserRecord {
                        display_name: None,
                        is_allowed: false,
                        is_admin: false,
                    });
                if let Some(name) = display_name {
                    rec.display_name = Some(name.to_string());
                }
                if is_seed_admin {
                    rec.is_admin = true;
                }
                Ok(user_view(platform_user_id, rec))
            }
            Backend::Sqlite(pool) => {
                sqlx::query(
                    "INSERT INTO user_account (platform_user_id, display_name, is_allowed, is_admin, created_at) \
                     VALUES (?1, ?2, 0, ?3, ?4) \
                     ON CONFLICT (platform_user_id) DO UPDATE SET \
                       display_name = COALESCE(excluded.display_name, user_account.display_name), \
                       is_admin = MAX(user_account.is_admin, excluded.is_admin)",
                )
                .bind(platform_user_id)
                .bind(display_name)
                .bind(is_seed_admin as i64)
                .bind(to_millis(Utc::now()))
                .execute(pool)
                .await?;

                let row: UserRow = sqlx::query_as(
                    "SELECT display_name, is_allowed, is_admin FROM user_account WHERE platform_user_id = ?1",
                )
                .bind(platform_user_id)
                .fetch_one(pool)
                .await?;
                Ok(UserView {
                    platform_user_id: platform_user_id.to_string(),
                    display_name: row.display_name,
                    is_allowed: row.is_allowed != 0 || row.is_admin != 0,
                    is_admin: row.is_admin != 0,
                })
            }
        }
    }

    pub async fn require_allowed(&self, platform_user_id: &str) -> Result<UserView, StateError> {
        let user = self.ensure_user(platform_user_id, None).await?;
        if user.is_allowed {
            Ok(user)
        } else {
            Err(StateError::Forbidden)
        }
    }

    pub async fn require_admin(&self, platform_user_id: &str) -> Result<UserView, StateError> {
        let user = self.ensure_user(platform_user_id, None).await?;
        if user.is_admin {
            Ok(user)
        } else {
            Err(StateError::Forbidden)
        }
    }

    /// Admin-gated allow/disallow. The target row is created when absent so
    /// an admin can pre-authorize a user who has never interacted.
    pub async fn set_allowed(
        &self,
        actor: &str,
        target: &str,
        allowed: bool,
    ) -> Result<UserView, StateError> {
        self.require_admin(actor).await?;
        match &self.backend {
            Backend::Memory(inner) => {
                let mut tables = inner.tables.write().await;
                let rec = tables
                    .users
                    .entry(target.to_string())
                    .or_insert_with(|| UserRecord {
                        display_name: None,
                        is_allowed: false,
                        is_admin: false,
                    });
                rec.is_allowed = allowed;
                Ok(user_view(target, rec))
            }
            Backend::Sqlite(pool) => {
                sqlx::query(
                    "INSERT INTO user_account (platform_user_id, is_allowed, is_admin, created_at) \
                     VALUES (?1, ?2, 0, ?3) \
                     ON CONFLICT (platform_user_id) DO UPDATE SET is_allowed = excluded.is_allowed",
                )
                .bind(target)
                .bind(allowed as i64)
                .bind(to_millis(Utc::now()))
                .execute(pool)
                .await?;
                self.ensure_user(target, None).await
            }
        }
    }

    // ---- machines --------------------------------------------------------

    /// Issue a machine identity. The plaintext secret is returned exactly
    /// once; only its SHA-256 digest is stored.
    pub async fn register_machine(&self, name: &str) -> Result<RegisterMachineResponse, StateError> {
        let machine_id = Uuid::new_v4().to_string();
        let secret = generate_secret();
        let now = Utc::now();
        match &self.backend {
            Backend::Memory(inner) => {
                let mut tables = inner.tables.write().await;
                tables.machines.insert(
                    machine_id.clone(),
                    MachineRecord {
                        name: name.to_string(),
                        secret_hash: hash_secret(&secret),
                        registered_at: now,
                        last_seen_at: now,
                    },
                );
            }
            Backend::Sqlite(pool) => {
                sqlx::query(
                    "INSERT INTO machine (machine_id, name, secret_hash, registered_at, last_seen_at) \
                     VALUES (?1, ?2, ?3, ?4, ?4)",
                )
                .bind(&machine_id)
                .bind(name)
                .bind(hash_secret(&secret))
                .bind(to_millis(now))
                .execute(pool)
                .await?;
            }
        }
        Ok(RegisterMachineResponse { machine_id, secret })
    }

    /// Verify machine credentials and bump `last_seen_at`. Unknown id and
    /// wrong secret produce the same error so callers cannot probe which
    /// machine ids exist.
    pub async fn authenticate_machine(
        &self,
        machine_id: &str,
        secret: &str,
    ) -> Result<(), StateError> {
        let presented = hash_secret(secret);
        match &self.backend {
            Backend::Memory(inner) => {
                let mut tables = inner.tables.write().await;
                match tables.machines.get_mut(machine_id) {
                    Some(rec) if rec.secret_hash == presented => {
                        rec.last_seen_at = Utc::now();
                        Ok(())
                    }
                    _ => Err(StateError::Unauthorized),
                }
            }
            Backend::Sqlite(pool) => {
                let stored: Option<(String,)> =
                    sqlx::query_as("SELECT secret_hash FROM machine WHERE machine_id = ?1")
                        .bind(machine_id)
                        .fetch_optional(pool)
                        .await?;
                match stored {
                    Some((hash,)) if hash == presented => {
                        sqlx::query("UPDATE machine SET last_seen_at = ?1 WHERE machine_id = ?2")
                            .bind(to_millis(Utc::now()))
                            .bind(machine_id)
                            .execute(pool)
                            .await?;
                        Ok(())
                    }
                    _ => Err(StateError::Unauthorized),
                }
            }
        }
    }

    pub async fn list_machines(&self) -> Result<Vec<MachineSummary>, StateError> {
        let now = Utc::now();
        match &self.backend {
            Backend::Memory(inner) => {
                let tables = inner.tables.read().await;
                let mut machines: Vec<MachineSummary> = tables
                    .machines
                    .iter()
                    .map(|(id, rec)| MachineSummary {
                        machine_id: id.clone(),
                        name: rec.name.clone(),
                        status: machine_status(now, rec.last_seen_at, self.machine_stale),
                        registered_at: rec.registered_at,
                        last_seen_at: rec.last_seen_at,
                    })
                    .collect();
                machines.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
                Ok(machines)
            }
            Backend::Sqlite(pool) => {
                let rows: Vec<MachineRow> = sqlx::query_as(
                    "SELECT machine_id, name, registered_at, last_seen_at \
                     FROM machine ORDER BY registered_at ASC",
                )
                .fetch_all(pool)
                .await?;
                Ok(rows
                    .into_iter()
                    .map(|row| {
                        let last_seen = from_millis(row.last_seen_at);
                        MachineSummary {
                            machine_id: row.machine_id,
                            name: row.name,
                            status: machine_status(now, last_seen, self.machine_stale),
                            registered_at: from_millis(row.registered_at),
                            last_seen_at: last_seen,
                        }
                    })
                    .collect())
            }
        }
    }

    async fn machine_exists(&self, machine_id: &str) -> Result<bool, StateError> {
        match &self.backend {
            Backend::Memory(inner) => {
                Ok(inner.tables.read().await.machines.contains_key(machine_id))
            }
            Backend::Sqlite(pool) => {
                let found: Option<(i64,)> =
                    sqlx::query_as("SELECT 1 FROM machine WHERE machine_id = ?1")
                        .bind(machine_id)
                        .fetch_optional(pool)
                        .await?;
                Ok(found.is_some())
            }
        }
    }

    // ---- scripts ---------------------------------------------------------

    /// Script names are unique per installation; re-registering an existing
    /// name is rejected rather than overwriting, because queued commands
    /// reference scripts by id.
    pub async fn register_script(
        &self,
        owner: &str,
        name: &str,
        content: &str,
    ) -> Result<ScriptCreated, StateError> {
        match &self.backend {
            Backend::Memory(inner) => {
                let mut tables = inner.tables.write().await;
                if tables.scripts.contains_key(name) {
                    return Err(StateError::ScriptNameTaken);
                }
                tables.next_script_id += 1;
                let script_id = tables.next_script_id;
                tables.scripts.insert(
                    name.to_string(),
                    ScriptRecord {
                        script_id,
                        content: content.to_string(),
                    },
                );
                Ok(ScriptCreated {
                    script_id,
                    name: name.to_string(),
                })
            }
            Backend::Sqlite(pool) => {
                let existing: Option<(i64,)> =
                    sqlx::query_as("SELECT id FROM script WHERE name = ?1")
                        .bind(name)
                        .fetch_optional(pool)
                        .await?;
                if existing.is_some() {
                    return Err(StateError::ScriptNameTaken);
                }
                let result = sqlx::query(
                    "INSERT INTO script (name, content, owner_user_id, created_at) \
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .bind(name)
                .bind(content)
                .bind(owner)
                .bind(to_millis(Utc::now()))
                .execute(pool)
                .await?;
                Ok(ScriptCreated {
                    script_id: result.last_insert_rowid(),
                    name: name.to_string(),
                })
            }
        }
    }

    // ---- command queue ---------------------------------------------------

    pub async fn create_command(
        &self,
        requester: &str,
        script_name: &str,
        machine_id: &str,
    ) -> Result<CommandView, StateError> {
        if !self.machine_exists(machine_id).await? {
            return Err(StateError::MachineNotFound);
        }
        let now = Utc::now();
        match &self.backend {
            Backend::Memory(inner) => {
                let mut tables = inner.tables.write().await;
                let script_id = tables
                    .scripts
                    .get(script_name)
                    .map(|s| s.script_id)
                    .ok_or(StateError::ScriptNotFound)?;
                tables.next_command_id += 1;
                let command_id = tables.next_command_id;
                tables.commands.insert(
                    command_id,
                    CommandRecord {
                        script_id,
                        target_machine_id: machine_id.to_string(),
                        requested_by: requester.to_string(),
                        state: CommandState::Pending,
                        created_at: now,
                        claimed_at: None,
                        completed_at: None,
                        output: None,
                        error: None,
                    },
                );
                drop(tables);
                self.get_command(command_id).await
            }
            Backend::Sqlite(pool) => {
                let script: Option<(i64,)> =
                    sqlx::query_as("SELECT id FROM script WHERE name = ?1")
                        .bind(script_name)
                        .fetch_optional(pool)
                        .await?;
                let (script_id,) = script.ok_or(StateError::ScriptNotFound)?;
                let result = sqlx::query(
                    "INSERT INTO command (script_id, target_machine_id, requested_by, state, created_at) \
                     VALUES (?1, ?2, ?3, 'pending', ?4)",
                )
                .bind(script_id)
                .bind(machine_id)
                .bind(requester)
                .bind(to_millis(now))
                .execute(pool)
                .await?;
                self.get_command(result.last_insert_rowid()).await
            }
        }
    }

    /// Pending commands for one target machine, oldest first so no command
    /// starves behind newer work.
    pub async fn pending_for_machine(
        &self,
        machine_id: &str,
    ) -> Result<Vec<PendingCommand>, StateError> {
        match &self.backend {
            Backend::Memory(inner) => {
                let tables = inner.tables.read().await;
                let mut pending: Vec<PendingCommand> = tables
                    .commands
                    .iter()
                    .filter(|(_, cmd)| {
                        cmd.state == CommandState::Pending && cmd.target_machine_id == machine_id
                    })
                    .map(|(id, cmd)| {
                        let (name, content) = script_by_id(&tables, cmd.script_id);
                        PendingCommand {
                            command_id: *id,
                            script_name: name,
                            script_content: content,
                            created_at: cmd.created_at,
                        }
                    })
                    .collect();
                pending.sort_by(|a, b| {
                    (a.created_at, a.command_id).cmp(&(b.created_at, b.command_id))
                });
                Ok(pending)
            }
            Backend::Sqlite(pool) => {
                let rows: Vec<CommandRow> = sqlx::query_as(&format!(
                    "{COMMAND_SELECT} WHERE c.target_machine_id = ?1 AND c.state = 'pending' \
                     ORDER BY c.created_at ASC, c.id ASC"
                ))
                .bind(machine_id)
                .fetch_all(pool)
                .await?;
                Ok(rows
                    .into_iter()
                    .map(|row| PendingCommand {
                        command_id: row.id,
                        script_name: row.script_name,
                        script_content: row.script_content,
                        created_at: from_millis(row.created_at),
                    })
                    .collect())
            }
        }
    }

    /// Atomic Pending -> Claimed transition. Everything other than a live
    /// Pending command targeted at this machine answers `AlreadyClaimed`;
    /// distinguishing the cases would leak other machines' queues.
    pub async fn claim_command(
        &self,
        command_id: i64,
        machine_id: &str,
    ) -> Result<(), StateError> {
        match &self.backend {
            Backend::Memory(inner) => {
                let mut tables = inner.tables.write().await;
                let cmd = tables
                    .commands
                    .get_mut(&command_id)
                    .ok_or(StateError::CommandNotFound)?;
                if cmd.state != CommandState::Pending || cmd.target_machine_id != machine_id {
                    return Err(StateError::AlreadyClaimed);
                }
                cmd.state = CommandState::Claimed;
                cmd.claimed_at = Some(Utc::now());
                Ok(())
            }
            Backend::Sqlite(pool) => {
                let updated = sqlx::query(
                    "UPDATE command SET state = 'claimed', claimed_at = ?1 \
                     WHERE id = ?2 AND state = 'pending' AND target_machine_id = ?3",
                )
                .bind(to_millis(Utc::now()))
                .bind(command_id)
                .bind(machine_id)
                .execute(pool)
                .await?;
                if updated.rows_affected() == 1 {
                    return Ok(());
                }
                let exists: Option<(String,)> =
                    sqlx::query_as("SELECT state FROM command WHERE id = ?1")
                        .bind(command_id)
                        .fetch_optional(pool)
                        .await?;
                match exists {
                    None => Err(StateError::CommandNotFound),
                    Some(_) => Err(StateError::AlreadyClaimed),
                }
            }
        }
    }

    /// Claimed -> Completed/Failed, writable only by the claiming machine.
    /// A report on an already-terminal command (typically one the watchdog
    /// timed out) is answered with `CommandFinished` so the agent stops
    /// retrying; the caller logs it rather than treating it as a fault.
    pub async fn report_result(
        &self,
        command_id: i64,
        machine_id: &str,
        report: &CommandReport,
    ) -> Result<CommandView, StateError> {
        let now = Utc::now();
        match &self.backend {
            Backend::Memory(inner) => {
                let mut tables = inner.tables.write().await;
                let cmd = tables
                    .commands
                    .get_mut(&command_id)
                    .ok_or(StateError::CommandNotFound)?;
                if cmd.target_machine_id != machine_id || cmd.state == CommandState::Pending {
                    return Err(StateError::NotClaimant);
                }
                if cmd.state != CommandState::Claimed {
                    return Err(StateError::CommandFinished(cmd.state));
                }
                apply_report(cmd, report, now);
                drop(tables);
                self.get_command(command_id).await
            }
            Backend::Sqlite(pool) => {
                let row: Option<CommandRow> =
                    sqlx::query_as(&format!("{COMMAND_SELECT} WHERE c.id = ?1"))
                        .bind(command_id)
                        .fetch_optional(pool)
                        .await?;
                let row = row.ok_or(StateError::CommandNotFound)?;
                let state = parse_state(&row.state)?;
                if row.target_machine_id != machine_id || state == CommandState::Pending {
                    return Err(StateError::NotClaimant);
                }
                if state != CommandState::Claimed {
                    return Err(StateError::CommandFinished(state));
                }
                let new_state = if report.is_success() {
                    CommandState::Completed
                } else {
                    CommandState::Failed
                };
                let updated = sqlx::query(
                    "UPDATE command SET state = ?1, output = ?2, error = ?3, completed_at = ?4 \
                     WHERE id = ?5 AND state = 'claimed'",
                )
                .bind(new_state.as_str())
                .bind(report.output.as_deref())
                .bind(report.error.as_deref())
                .bind(to_millis(now))
                .bind(command_id)
                .execute(pool)
                .await?;
                if updated.rows_affected() == 0 {
                    // Lost a race with the watchdog between the read and the
                    // conditional update.
                    let (state,): (String,) =
                        sqlx::query_as("SELECT state FROM command WHERE id = ?1")
                            .bind(command_id)
                            .fetch_one(pool)
                            .await?;
                    return Err(StateError::CommandFinished(parse_state(&state)?));
                }
                self.get_command(command_id).await
            }
        }
    }

    pub async fn get_command(&self, command_id: i64) -> Result<CommandView, StateError> {
        match &self.backend {
            Backend::Memory(inner) => {
                let tables = inner.tables.read().await;
                let cmd = tables
                    .commands
                    .get(&command_id)
                    .ok_or(StateError::CommandNotFound)?;
                Ok(command_view(&tables, command_id, cmd))
            }
            Backend::Sqlite(pool) => {
                let row: Option<CommandRow> =
                    sqlx::query_as(&format!("{COMMAND_SELECT} WHERE c.id = ?1"))
                        .bind(command_id)
                        .fetch_optional(pool)
                        .await?;
                row.ok_or(StateError::CommandNotFound)
                    .and_then(row_to_view)
            }
        }
    }

    /// Recent commands, newest first, filtered in process. The listing is a
    /// human-facing audit view, not a queue; 500 most recent is plenty.
    pub async fn list_commands(
        &self,
        filter: &CommandFilter,
    ) -> Result<Vec<CommandView>, StateError> {
        let mut views = match &self.backend {
            Backend::Memory(inner) => {
                let tables = inner.tables.read().await;
                tables
                    .commands
                    .iter()
                    .rev()
                    .take(500)
                    .map(|(id, cmd)| command_view(&tables, *id, cmd))
                    .collect::<Vec<_>>()
            }
            Backend::Sqlite(pool) => {
                let rows: Vec<CommandRow> =
                    sqlx::query_as(&format!("{COMMAND_SELECT} ORDER BY c.id DESC LIMIT 500"))
                        .fetch_all(pool)
                        .await?;
                rows.into_iter()
                    .map(row_to_view)
                    .collect::<Result<Vec<_>, _>>()?
            }
        };
        views.retain(|view| {
            filter
                .machine_id
                .as_deref()
                .map_or(true, |m| view.target_machine_id == m)
                && filter.state.map_or(true, |s| view.state == s)
                && filter
                    .requested_by
                    .as_deref()
                    .map_or(true, |u| view.requested_by == u)
        });
        Ok(views)
    }

    /// Watchdog pass: Pending past the dispatch timeout becomes Expired,
    /// Claimed past the execution timeout becomes Failed. Both transitions
    /// use the same conditional updates as claim/report, so a late claim or
    /// report racing the sweep still resolves to one winner.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<SweepOutcome, StateError> {
        let dispatch_cutoff = now - self.dispatch_timeout;
        let execution_cutoff = now - self.execution_timeout;
        match &self.backend {
            Backend::Memory(inner) => {
                let mut tables = inner.tables.write().await;
                let mut outcome = SweepOutcome::default();
                for cmd in tables.commands.values_mut() {
                    match cmd.state {
                        CommandState::Pending if cmd.created_at <= dispatch_cutoff => {
                            cmd.state = CommandState::Expired;
                            cmd.completed_at = Some(now);
                            outcome.expired += 1;
                        }
                        CommandState::Claimed
                            if cmd.claimed_at.is_some_and(|t| t <= execution_cutoff) =>
                        {
                            cmd.state = CommandState::Failed;
                            cmd.error = Some(TIMEOUT_ERROR.to_string());
                            cmd.completed_at = Some(now);
                            outcome.failed += 1;
                        }
                        _ => {}
                    }
                }
                Ok(outcome)
            }
            Backend::Sqlite(pool) => {
                let expired = sqlx::query(
                    "UPDATE command SET state = 'expired', completed_at = ?1 \
                     WHERE state = 'pending' AND created_at <= ?2",
                )
                .bind(to_millis(now))
                .bind(to_millis(dispatch_cutoff))
                .execute(pool)
                .await?
                .rows_affected();
                let failed = sqlx::query(
                    "UPDATE command SET state = 'failed', error = ?1, completed_at = ?2 \
                     WHERE state = 'claimed' AND claimed_at <= ?3",
                )
                .bind(TIMEOUT_ERROR)
                .bind(to_millis(now))
                .bind(to_millis(execution_cutoff))
                .execute(pool)
                .await?
                .rows_affected();
                Ok(SweepOutcome { expired, failed })
            }
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_report(cmd: &mut CommandRecord, report: &CommandReport, now: DateTime<Utc>) {
    if report.is_success() {
        cmd.state = CommandState::Completed;
        cmd.output = report.output.clone();
    } else {
        cmd.state = CommandState::Failed;
        cmd.error = report.error.clone();
    }
    cmd.completed_at = Some(now);
}

fn user_view(platform_user_id: &str, rec: &UserRecord) -> UserView {
    UserView {
        platform_user_id: platform_user_id.to_string(),
        display_name: rec.display_name.clone(),
        // An admin is implicitly allowed; the flag is not duplicated in the row.
        is_allowed: rec.is_allowed || rec.is_admin,
        is_admin: rec.is_admin,
    }
}

fn machine_status(now: DateTime<Utc>, last_seen: DateTime<Utc>, stale: Duration) -> MachineStatus {
    if now - last_seen > stale {
        MachineStatus::Stale
    } else {
        MachineStatus::Active
    }
}

fn script_by_id(tables: &MemTables, script_id: i64) -> (String, String) {
    tables
        .scripts
        .iter()
        .find(|(_, s)| s.script_id == script_id)
        .map(|(name, s)| (name.clone(), s.content.clone()))
        .unwrap_or_else(|| {
            warn!(script_id, "command references a missing script");
            (String::new(), String::new())
        })
}

fn command_view(tables: &MemTables, command_id: i64, cmd: &CommandRecord) -> CommandView {
    let (script_name, _) = script_by_id(tables, cmd.script_id);
    CommandView {
        command_id,
        script_name,
        target_machine_id: cmd.target_machine_id.clone(),
        requested_by: cmd.requested_by.clone(),
        state: cmd.state,
        created_at: cmd.created_at,
        claimed_at: cmd.claimed_at,
        completed_at: cmd.completed_at,
        output: cmd.output.clone(),
        error: cmd.error.clone(),
    }
}

fn row_to_view(row: CommandRow) -> Result<CommandView, StateError> {
    Ok(CommandView {
        command_id: row.id,
        script_name: row.script_name,
        target_machine_id: row.target_machine_id,
        requested_by: row.requested_by,
        state: parse_state(&row.state)?,
        created_at: from_millis(row.created_at),
        claimed_at: row.claimed_at.map(from_millis),
        completed_at: row.completed_at.map(from_millis),
        output: row.output,
        error: row.error,
    })
}

fn parse_state(raw: &str) -> Result<CommandState, StateError> {
    raw.parse()
        .map_err(|_| StateError::CorruptState(raw.to_string()))
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .map(char::from)
        .take(40)
        .collect()
}

pub(crate) fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded_state() -> (AppState, String) {
        let state = AppState::new().with_admin(Some("admin-1".into()));
        state.ensure_user("admin-1", None).await.unwrap();
        state.set_allowed("admin-1", "user-1", true).await.unwrap();
        state
            .register_script("user-1", "ping", "echo pong")
            .await
            .unwrap();
        let machine = state.register_machine("web-01").await.unwrap();
        (state, machine.machine_id)
    }

    #[tokio::test]
    async fn admin_is_implicitly_allowed() {
        let state = AppState::new().with_admin(Some("admin-1".into()));
        let admin = state.ensure_user("admin-1", None).await.unwrap();
        assert!(admin.is_admin);
        assert!(admin.is_allowed);

        let stranger = state.ensure_user("user-9", None).await.unwrap();
        assert!(!stranger.is_admin);
        assert!(!stranger.is_allowed);
    }

    #[tokio::test]
    async fn set_allowed_rejects_non_admin_and_leaves_target_unchanged() {
        let state = AppState::new().with_admin(Some("admin-1".into()));
        state.ensure_user("user-2", None).await.unwrap();

        let err = state.set_allowed("user-2", "user-3", true).await.unwrap_err();
        assert!(matches!(err, StateError::Forbidden));

        let target = state.ensure_user("user-3", None).await.unwrap();
        assert!(!target.is_allowed);
    }

    #[tokio::test]
    async fn duplicate_script_name_is_rejected() {
        let state = AppState::new();
        state
            .register_script("user-1", "ping", "echo pong")
            .await
            .unwrap();
        let err = state
            .register_script("user-1", "ping", "echo other")
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::ScriptNameTaken));
    }

    #[tokio::test]
    async fn concurrent_claims_have_exactly_one_winner() {
        let (state, machine_id) = seeded_state().await;
        let command = state
            .create_command("user-1", "ping", &machine_id)
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let state = state.clone();
            let machine_id = machine_id.clone();
            handles.push(tokio::spawn(async move {
                state.claim_command(command.command_id, &machine_id).await
            }));
        }

        let mut wins = 0;
        let mut losses = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => wins += 1,
                Err(StateError::AlreadyClaimed) => losses += 1,
                Err(other) => panic!("unexpected claim error: {other}"),
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(losses, 7);
    }

    #[tokio::test]
    async fn report_requires_the_claiming_machine() {
        let (state, machine_id) = seeded_state().await;
        let other = state.register_machine("web-02").await.unwrap();
        let command = state
            .create_command("user-1", "ping", &machine_id)
            .await
            .unwrap();

        // Nobody has claimed yet: even the target machine cannot report.
        let err = state
            .report_result(command.command_id, &machine_id, &CommandReport::success("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::NotClaimant));

        state
            .claim_command(command.command_id, &machine_id)
            .await
            .unwrap();
        let err = state
            .report_result(
                command.command_id,
                &other.machine_id,
                &CommandReport::success("x"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::NotClaimant));
    }

    #[tokio::test]
    async fn watchdog_expires_pending_and_fails_claimed() {
        let (state, machine_id) = seeded_state().await;
        let state = state.with_timeouts(
            Duration::zero(),
            Duration::zero(),
            Duration::seconds(300),
        );
        let stuck = state
            .create_command("user-1", "ping", &machine_id)
            .await
            .unwrap();
        let hung = state
            .create_command("user-1", "ping", &machine_id)
            .await
            .unwrap();
        state.claim_command(hung.command_id, &machine_id).await.unwrap();

        let outcome = state.expire_overdue(Utc::now()).await.unwrap();
        assert_eq!(outcome.expired, 1);
        assert_eq!(outcome.failed, 1);

        let stuck = state.get_command(stuck.command_id).await.unwrap();
        assert_eq!(stuck.state, CommandState::Expired);
        // Expired commands are no longer visible to polls or claimable.
        assert!(state.pending_for_machine(&machine_id).await.unwrap().is_empty());
        let err = state
            .claim_command(stuck.command_id, &machine_id)
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::AlreadyClaimed));

        let hung = state.get_command(hung.command_id).await.unwrap();
        assert_eq!(hung.state, CommandState::Failed);
        assert_eq!(hung.error.as_deref(), Some(TIMEOUT_ERROR));

        // A late report from the claimant is a no-op answered with the
        // terminal state, not an authorization error.
        let err = state
            .report_result(hung.command_id, &machine_id, &CommandReport::success("late"))
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::CommandFinished(CommandState::Failed)));
    }

    #[tokio::test]
    async fn machine_auth_is_uniform_and_bumps_last_seen() {
        let state = AppState::new();
        let machine = state.register_machine("web-01").await.unwrap();

        assert!(state
            .authenticate_machine(&machine.machine_id, &machine.secret)
            .await
            .is_ok());
        let wrong_secret = state
            .authenticate_machine(&machine.machine_id, "nope")
            .await
            .unwrap_err();
        let unknown_id = state
            .authenticate_machine("not-a-machine", &machine.secret)
            .await
            .unwrap_err();
        assert_eq!(wrong_secret.to_string(), unknown_id.to_string());

        let machines = state.list_machines().await.unwrap();
        assert_eq!(machines.len(), 1);
        assert_eq!(machines[0].status, MachineStatus::Active);
    }

    #[tokio::test]
    async fn pending_commands_come_back_oldest_first() {
        let (state, machine_id) = seeded_state().await;
        let first = state
            .create_command("user-1", "ping", &machine_id)
            .await
            .unwrap();
        let second = state
            .create_command("user-1", "ping", &machine_id)
            .await
            .unwrap();

        let pending = state.pending_for_machine(&machine_id).await.unwrap();
        assert_eq!(
            pending.iter().map(|p| p.command_id).collect::<Vec<_>>(),
            vec![first.command_id, second.command_id]
        );
        assert_eq!(pending[0].script_content, "echo pong");
    }
}
