//! The built-in defaults layer. Every variable a stage skeleton or policy
//! check reads has a defined value before any include or manifest layer
//! runs, so an empty manifest still composes.

/// Lowest-precedence layer, parsed once per compilation.
pub const BUILTIN_DEFAULTS: &str = r#"
rootfs_rpms: []
kernel_modules: []
denylist_rpms: []
denylist_modules: []
systemd_enabled_services: []
systemd_disabled_services: []
enabled_repos: []
kernel_cmdline: ""
hostname: localhost
"#;
