//! SQLite schema for the relational side of the platform.
//!
//! The event journal's `UNIQUE(conversation_id, sequence_number)` index backs
//! the no-gaps/no-duplicates guarantee; allocation happens inside the append
//! transaction in `sqlite.rs`.

pub const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS conversations (
        id             TEXT PRIMARY KEY,
        tenant_id      TEXT NOT NULL,
        project_id     TEXT NOT NULL,
        user_id        TEXT NOT NULL,
        title          TEXT,
        status         TEXT NOT NULL DEFAULT 'active',
        agent_config   TEXT NOT NULL DEFAULT '{}',
        message_count  INTEGER NOT NULL DEFAULT 0,
        created_at     INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_conversations_project
        ON conversations(project_id, user_id);

    CREATE TABLE IF NOT EXISTS agent_execution_events (
        id               TEXT PRIMARY KEY,
        conversation_id  TEXT NOT NULL,
        message_id       TEXT NOT NULL,
        sequence_number  INTEGER NOT NULL,
        event_type       TEXT NOT NULL,
        event_data       TEXT NOT NULL,
        created_at       INTEGER NOT NULL
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_events_conversation_seq
        ON agent_execution_events(conversation_id, sequence_number);
    CREATE INDEX IF NOT EXISTS idx_events_message
        ON agent_execution_events(message_id);

    CREATE TABLE IF NOT EXISTS execution_checkpoints (
        id               TEXT PRIMARY KEY,
        conversation_id  TEXT NOT NULL,
        message_id       TEXT NOT NULL,
        kind             TEXT NOT NULL,
        state            TEXT NOT NULL,
        created_at       INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_checkpoints_message
        ON execution_checkpoints(message_id, created_at);
    CREATE INDEX IF NOT EXISTS idx_checkpoints_conversation
        ON execution_checkpoints(conversation_id);

    CREATE TABLE IF NOT EXISTS tool_executions (
        id               TEXT PRIMARY KEY,
        conversation_id  TEXT NOT NULL,
        message_id       TEXT NOT NULL,
        tool_name        TEXT NOT NULL,
        arguments        TEXT NOT NULL,
        result           TEXT,
        error            TEXT,
        duration_ms      INTEGER NOT NULL,
        started_at       INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_tool_executions_conversation
        ON tool_executions(conversation_id);

    CREATE TABLE IF NOT EXISTS hitl_requests (
        request_id       TEXT PRIMARY KEY,
        conversation_id  TEXT NOT NULL,
        message_id       TEXT NOT NULL,
        kind             TEXT NOT NULL,
        prompt           TEXT NOT NULL,
        options          TEXT NOT NULL,
        default_choice   TEXT,
        allow_custom     INTEGER NOT NULL DEFAULT 0,
        timeout_deadline INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_hitl_requests_conversation
        ON hitl_requests(conversation_id);
";
