/// Ordered schema migrations, applied inside one transaction each.
pub const MIGRATIONS: &[(i64, &[&str])] = &[
    (
        1,
        &[
            "CREATE TABLE projects (
                name TEXT PRIMARY KEY,
                working_dir TEXT NOT NULL,
                port_range TEXT NOT NULL
            )",
            "CREATE TABLE port_ranges (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                start_port INTEGER NOT NULL,
                end_port INTEGER NOT NULL,
                active INTEGER NOT NULL DEFAULT 1
            )",
            "CREATE TABLE port_allocations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project TEXT NOT NULL,
                service_name TEXT NOT NULL,
                port INTEGER NOT NULL,
                service_type TEXT NOT NULL DEFAULT 'generic',
                host TEXT NOT NULL DEFAULT 'localhost',
                protocol TEXT NOT NULL DEFAULT 'tcp',
                status TEXT NOT NULL DEFAULT 'allocated',
                cloudflare_hostname TEXT,
                allocated_at TEXT NOT NULL,
                released_at TEXT
            )",
            "CREATE UNIQUE INDEX idx_allocations_active_service
                ON port_allocations (project, service_name) WHERE status = 'allocated'",
            "CREATE UNIQUE INDEX idx_allocations_active_port
                ON port_allocations (port, host, protocol) WHERE status = 'allocated'",
        ],
    ),
    (
        2,
        &[
            "CREATE TABLE secrets (
                key_path TEXT PRIMARY KEY,
                ciphertext TEXT NOT NULL,
                iv TEXT NOT NULL,
                auth_tag TEXT NOT NULL,
                description TEXT NOT NULL,
                scope TEXT NOT NULL,
                project TEXT,
                service TEXT,
                expires_at TEXT,
                access_count INTEGER NOT NULL DEFAULT 0,
                last_accessed TEXT,
                needs_rotation INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            "CREATE TABLE secret_access_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key_path TEXT NOT NULL,
                accessed_by TEXT,
                success INTEGER NOT NULL,
                accessed_at TEXT NOT NULL
            )",
        ],
    ),
    (
        3,
        &[
            "CREATE TABLE cnames (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                subdomain TEXT NOT NULL,
                domain TEXT NOT NULL,
                full_hostname TEXT NOT NULL UNIQUE,
                target_service TEXT NOT NULL,
                target_type TEXT NOT NULL,
                container_name TEXT,
                docker_network TEXT,
                project TEXT NOT NULL,
                cloudflare_record_id TEXT,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (subdomain, domain)
            )",
            "CREATE TABLE cloudflare_domains (
                domain TEXT PRIMARY KEY,
                zone_id TEXT NOT NULL,
                last_seen TEXT NOT NULL
            )",
            "CREATE TABLE tunnel_health (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                status TEXT NOT NULL,
                uptime_s INTEGER NOT NULL,
                restart_count INTEGER NOT NULL,
                last_error TEXT
            )",
            "CREATE TABLE audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                action TEXT NOT NULL,
                project TEXT,
                details TEXT NOT NULL,
                success INTEGER NOT NULL,
                error_message TEXT
            )",
        ],
    ),
    (
        4,
        &[
            "CREATE TABLE containers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                container_id TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                image TEXT NOT NULL,
                status TEXT NOT NULL,
                project TEXT,
                generation INTEGER NOT NULL,
                last_seen TEXT NOT NULL
            )",
            "CREATE TABLE networks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                network_id TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                driver TEXT NOT NULL,
                generation INTEGER NOT NULL
            )",
            "CREATE TABLE container_networks (
                container_id INTEGER NOT NULL REFERENCES containers (id) ON DELETE CASCADE,
                network_id INTEGER NOT NULL REFERENCES networks (id) ON DELETE CASCADE,
                ip_address TEXT,
                PRIMARY KEY (container_id, network_id)
            )",
            "CREATE TABLE container_ports (
                container_id INTEGER NOT NULL REFERENCES containers (id) ON DELETE CASCADE,
                internal_port INTEGER NOT NULL,
                host_port INTEGER,
                protocol TEXT NOT NULL DEFAULT 'tcp',
                PRIMARY KEY (container_id, internal_port, protocol)
            )",
        ],
    ),
];
