/// Mirror schema. Ids are platform snowflakes stored as INTEGER so range
/// comparisons (checkpoints, thread cutoffs) happen numerically.
pub const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS servers (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        icon TEXT,
        description TEXT,
        vanity_url_code TEXT,
        approximate_member_count INTEGER,
        kicked_at DATETIME,
        updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
    );

    CREATE TABLE IF NOT EXISTS channels (
        id INTEGER PRIMARY KEY,
        server_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        kind INTEGER NOT NULL,
        parent_id INTEGER,
        archived_at TEXT,
        updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
    );
    CREATE INDEX IF NOT EXISTS idx_channels_server ON channels (server_id);
    CREATE INDEX IF NOT EXISTS idx_channels_parent ON channels (parent_id);

    CREATE TABLE IF NOT EXISTS channel_settings (
        channel_id INTEGER PRIMARY KEY,
        server_id INTEGER NOT NULL,
        indexing_enabled BOOLEAN NOT NULL DEFAULT FALSE,
        last_indexed_snowflake INTEGER,
        last_indexed_at TEXT,
        invite_code TEXT,
        solution_tag_id INTEGER,
        flags INTEGER NOT NULL DEFAULT 0,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
    );
    CREATE INDEX IF NOT EXISTS idx_channel_settings_server
        ON channel_settings (server_id, indexing_enabled);

    CREATE TABLE IF NOT EXISTS accounts (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        avatar TEXT,
        updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
    );

    CREATE TABLE IF NOT EXISTS bot_server_settings (
        user_id INTEGER NOT NULL,
        server_id INTEGER NOT NULL,
        permissions INTEGER NOT NULL DEFAULT 0,
        indexing_disabled BOOLEAN NOT NULL DEFAULT FALSE,
        updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY (user_id, server_id)
    );

    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY,
        author_id INTEGER NOT NULL,
        server_id INTEGER NOT NULL,
        channel_id INTEGER NOT NULL,
        parent_channel_id INTEGER,
        child_thread_id INTEGER,
        question_id INTEGER,
        reference_id INTEGER,
        content TEXT NOT NULL,
        flags INTEGER NOT NULL DEFAULT 0,
        kind INTEGER NOT NULL DEFAULT 0,
        pinned BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TEXT,
        embeds TEXT NOT NULL DEFAULT '[]',
        reactions TEXT NOT NULL DEFAULT '[]',
        updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
    );
    CREATE INDEX IF NOT EXISTS idx_messages_channel ON messages (channel_id, id);

    CREATE TABLE IF NOT EXISTS attachments (
        id INTEGER PRIMARY KEY,
        message_id INTEGER NOT NULL,
        filename TEXT NOT NULL,
        url TEXT NOT NULL,
        content_type TEXT,
        size INTEGER NOT NULL DEFAULT 0,
        width INTEGER,
        height INTEGER,
        storage_id TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_attachments_message ON attachments (message_id);

    CREATE TABLE IF NOT EXISTS embed_images (
        message_id INTEGER NOT NULL,
        url TEXT NOT NULL,
        storage_id TEXT,
        PRIMARY KEY (message_id, url)
    );
";
