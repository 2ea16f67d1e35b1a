// ABOUTME: SQL schema for the relational index. Every table is created up front, whether or not
// ABOUTME: the feature that owns it writes to it yet, so later features never need a migration step.

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    path TEXT NOT NULL,
    createdAt INTEGER NOT NULL,
    lastOpenedAt INTEGER NOT NULL,
    isActive INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS exchanges (
    id TEXT PRIMARY KEY,
    projectId TEXT NOT NULL,
    providerId TEXT NOT NULL,
    modelId TEXT NOT NULL,
    purpose TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    promptTokens INTEGER,
    completionTokens INTEGER,
    totalTokens INTEGER,
    assistantText TEXT,
    flags TEXT,
    labels TEXT,
    rawFile TEXT NOT NULL,
    rawAvailable INTEGER NOT NULL DEFAULT 1,
    hasCodeBlock INTEGER,
    codeLanguages TEXT,
    hasCommand INTEGER,
    hasStacktrace INTEGER,
    detectedTopics TEXT,
    filePaths TEXT,
    duplicateHash TEXT,
    contextFile TEXT,
    contextLanguage TEXT,
    contextModule TEXT,
    contextBranch TEXT,
    openFiles TEXT,
    FOREIGN KEY (projectId) REFERENCES projects(id)
);

CREATE INDEX IF NOT EXISTS idx_exchanges_project ON exchanges(projectId);
CREATE INDEX IF NOT EXISTS idx_exchanges_timestamp ON exchanges(timestamp);
CREATE INDEX IF NOT EXISTS idx_exchanges_purpose ON exchanges(purpose);
CREATE INDEX IF NOT EXISTS idx_exchanges_duplicate_hash ON exchanges(duplicateHash);
CREATE INDEX IF NOT EXISTS idx_exchanges_has_code ON exchanges(hasCodeBlock);

CREATE TABLE IF NOT EXISTS code_elements (
    id TEXT PRIMARY KEY,
    projectId TEXT NOT NULL,
    filePath TEXT NOT NULL,
    elementType TEXT NOT NULL,
    name TEXT NOT NULL,
    signature TEXT,
    startLine INTEGER,
    endLine INTEGER,
    parentId TEXT,
    exchangeId TEXT,
    updatedAt INTEGER NOT NULL,
    FOREIGN KEY (projectId) REFERENCES projects(id)
);

CREATE INDEX IF NOT EXISTS idx_code_elements_file ON code_elements(projectId, filePath);

CREATE TABLE IF NOT EXISTS summary_nodes (
    id TEXT PRIMARY KEY,
    projectId TEXT NOT NULL,
    level TEXT NOT NULL,
    target TEXT NOT NULL,
    parentId TEXT,
    exchangeId TEXT,
    contentHash TEXT,
    summary TEXT,
    updatedAt INTEGER NOT NULL,
    FOREIGN KEY (projectId) REFERENCES projects(id)
);

CREATE INDEX IF NOT EXISTS idx_summary_nodes_target ON summary_nodes(projectId, target);

CREATE TABLE IF NOT EXISTS summary_config (
    projectId TEXT PRIMARY KEY,
    enabled INTEGER NOT NULL DEFAULT 0,
    providerId TEXT,
    modelId TEXT,
    maxFilesPerRun INTEGER,
    includePatterns TEXT,
    excludePatterns TEXT,
    FOREIGN KEY (projectId) REFERENCES projects(id)
);

CREATE TABLE IF NOT EXISTS collections (
    id TEXT PRIMARY KEY,
    projectId TEXT,
    name TEXT NOT NULL,
    description TEXT,
    createdAt INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS collection_items (
    collectionId TEXT NOT NULL,
    exchangeId TEXT NOT NULL,
    addedAt INTEGER NOT NULL,
    PRIMARY KEY (collectionId, exchangeId),
    FOREIGN KEY (collectionId) REFERENCES collections(id)
);

CREATE TABLE IF NOT EXISTS bookmarks (
    id TEXT PRIMARY KEY,
    exchangeId TEXT NOT NULL,
    note TEXT,
    createdAt INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS bookmark_tags (
    bookmarkId TEXT NOT NULL,
    tag TEXT NOT NULL,
    PRIMARY KEY (bookmarkId, tag),
    FOREIGN KEY (bookmarkId) REFERENCES bookmarks(id)
);

CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;
