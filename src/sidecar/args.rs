use std::path::Path;

use crate::options::helper_owned_flag;
use crate::protocol::MountOptions;

/// Argument vector of one mount process: `<binary> [flags] <bucket> <mount_point>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountCommand {
    pub binary: String,
    pub args: Vec<String>,
}

impl MountCommand {
    pub fn build(
        binary: &str,
        bucket: &str,
        mount_point: &Path,
        options: &MountOptions,
        token_socket: Option<&Path>,
    ) -> Self {
        // The helper supervises the process, so it must not daemonize.
        let mut args = vec!["--foreground".to_string()];

        if options.implicit_dirs {
            args.push("--implicit-dirs".to_string());
        }
        if let Some(cache_dir) = &options.cache_dir {
            args.push("--cache-dir".to_string());
            args.push(cache_dir.display().to_string());
        }
        if options.read_only {
            args.push("-o".to_string());
            args.push("ro".to_string());
        }
        if let Some(uid) = options.uid {
            args.push("--uid".to_string());
            args.push(uid.to_string());
        }
        if let Some(gid) = options.gid {
            args.push("--gid".to_string());
            args.push(gid.to_string());
        }
        if let Some(socket) = token_socket {
            args.push("--token-url".to_string());
            args.push(format!("unix://{}", socket.display()));
        }
        for flag in &options.extra_flags {
            if let Some(owned) = helper_owned_flag(flag) {
                tracing::warn!(flag = %flag, owned, "Dropping user flag that overrides a helper flag");
                continue;
            }
            args.extend(normalize_flag(flag));
        }

        args.push(bucket.to_string());
        args.push(mount_point.display().to_string());

        Self { binary: binary.to_string(), args }
    }
}

/// `implicit-dirs` and `--implicit-dirs` both become `--implicit-dirs`.
fn normalize_flag(flag: &str) -> Option<String> {
    let flag = flag.trim();
    if flag.is_empty() {
        return None;
    }
    if flag.starts_with('-') { Some(flag.to_string()) } else { Some(format!("--{flag}")) }
}
