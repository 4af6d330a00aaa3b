// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Embedded SQLite Schema
//!
//! DDL for the development store. The Postgres schema is managed by the
//! external migration tool and is expected to exist; only the SQLite store
//! creates tables on open.
//!
//! Timestamps are stored as RFC 3339 UTC text. JSON payloads (stage IO,
//! context values, capability lists, event details) are stored as text.

/// All tables and indexes, executable statement by statement.
pub const SQLITE_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS application (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        description TEXT
    )",
    "CREATE TABLE IF NOT EXISTS api_key (
        key TEXT PRIMARY KEY,
        application_id INTEGER NOT NULL REFERENCES application(id),
        created_at TEXT NOT NULL,
        expires_at TEXT,
        disabled_at TEXT,
        last_used_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS user (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS user_application (
        user_id INTEGER NOT NULL REFERENCES user(id),
        application_id INTEGER NOT NULL REFERENCES application(id),
        PRIMARY KEY (user_id, application_id)
    )",
    "CREATE TABLE IF NOT EXISTS pipeline (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        application_id INTEGER NOT NULL REFERENCES application(id),
        name TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'NotStarted',
        trace_id TEXT NOT NULL,
        is_completed INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        finished_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS stage (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        pipeline_id INTEGER NOT NULL REFERENCES pipeline(id),
        ordinal INTEGER NOT NULL,
        handler TEXT NOT NULL,
        name TEXT NOT NULL,
        description TEXT,
        span_id TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'NotStarted',
        is_skipped INTEGER NOT NULL DEFAULT 0,
        is_event INTEGER NOT NULL DEFAULT 0,
        retry_attempt INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        started_at TEXT,
        finished_at TEXT,
        next_retry_at TEXT,
        UNIQUE (pipeline_id, ordinal)
    )",
    "CREATE TABLE IF NOT EXISTS stage_io (
        stage_id INTEGER PRIMARY KEY REFERENCES stage(id),
        input TEXT,
        output TEXT
    )",
    "CREATE TABLE IF NOT EXISTS stage_options (
        stage_id INTEGER PRIMARY KEY REFERENCES stage(id),
        max_retries INTEGER NOT NULL DEFAULT 0,
        retry_interval_sec INTEGER NOT NULL DEFAULT 0,
        timeout_sec INTEGER,
        notify_on_failure INTEGER NOT NULL DEFAULT 0,
        retry_only_policy TEXT
    )",
    "CREATE TABLE IF NOT EXISTS stage_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        stage_id INTEGER NOT NULL REFERENCES stage(id),
        created_at TEXT NOT NULL,
        log_level TEXT NOT NULL,
        message TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS keyword (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        UNIQUE (key, value)
    )",
    "CREATE TABLE IF NOT EXISTS pipeline_keyword (
        pipeline_id INTEGER NOT NULL REFERENCES pipeline(id),
        keyword_id INTEGER NOT NULL REFERENCES keyword(id),
        PRIMARY KEY (pipeline_id, keyword_id)
    )",
    "CREATE TABLE IF NOT EXISTS pipeline_context_item (
        pipeline_id INTEGER NOT NULL REFERENCES pipeline(id),
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        value_type TEXT,
        PRIMARY KEY (pipeline_id, key)
    )",
    "CREATE TABLE IF NOT EXISTS log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        application_id INTEGER NOT NULL REFERENCES application(id),
        created_at TEXT NOT NULL,
        log_level TEXT NOT NULL,
        message TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS log_keyword (
        log_id INTEGER NOT NULL REFERENCES log(id),
        keyword_id INTEGER NOT NULL REFERENCES keyword(id),
        PRIMARY KEY (log_id, keyword_id)
    )",
    "CREATE TABLE IF NOT EXISTS worker_client (
        id TEXT PRIMARY KEY,
        application_id INTEGER NOT NULL REFERENCES application(id),
        worker_name TEXT NOT NULL,
        instance_id TEXT NOT NULL,
        state TEXT NOT NULL,
        in_flight INTEGER NOT NULL DEFAULT 0,
        jobs_processed INTEGER NOT NULL DEFAULT 0,
        jobs_failed INTEGER NOT NULL DEFAULT 0,
        queue_lag INTEGER NOT NULL DEFAULT 0,
        cpu_percent REAL NOT NULL DEFAULT 0,
        memory_mb REAL NOT NULL DEFAULT 0,
        last_error TEXT,
        capabilities TEXT NOT NULL DEFAULT '[]',
        handlers TEXT NOT NULL DEFAULT '[]',
        session_token TEXT,
        session_expires_at TEXT,
        last_seen_at TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        stopped_at TEXT,
        UNIQUE (application_id, instance_id)
    )",
    "CREATE TABLE IF NOT EXISTS worker_heartbeat (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        worker_id TEXT NOT NULL REFERENCES worker_client(id),
        ts TEXT NOT NULL,
        state TEXT NOT NULL,
        in_flight INTEGER NOT NULL,
        jobs_processed INTEGER NOT NULL,
        jobs_failed INTEGER NOT NULL,
        queue_lag INTEGER NOT NULL,
        cpu_percent REAL NOT NULL,
        memory_mb REAL NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS worker_event (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        worker_id TEXT NOT NULL REFERENCES worker_client(id),
        ts TEXT NOT NULL,
        level TEXT NOT NULL,
        event_type TEXT NOT NULL,
        message TEXT NOT NULL,
        details TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_stage_pipeline ON stage(pipeline_id, ordinal)",
    "CREATE INDEX IF NOT EXISTS idx_stage_status ON stage(status)",
    "CREATE INDEX IF NOT EXISTS idx_stage_log_stage ON stage_log(stage_id)",
    "CREATE INDEX IF NOT EXISTS idx_pipeline_app ON pipeline(application_id)",
    "CREATE INDEX IF NOT EXISTS idx_pipeline_status ON pipeline(status)",
    "CREATE INDEX IF NOT EXISTS idx_worker_client_session ON worker_client(session_token)",
    "CREATE INDEX IF NOT EXISTS idx_worker_event_worker ON worker_event(worker_id)",
    "CREATE INDEX IF NOT EXISTS idx_worker_heartbeat_worker ON worker_heartbeat(worker_id)",
];
