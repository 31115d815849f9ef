//! Operations behind the non-daemon CLI verbs (`stop`, `add`).

use std::collections::HashMap;
use std::path::Path;

use mcpl_core::config::{self, Config, ServerConfig};

use crate::error::DaemonError;

/// Signal the daemon named by the PID file with SIGTERM, its sole shutdown
/// trigger. Returns the signalled PID.
pub fn stop_daemon(pid_path: &Path) -> Result<u32, DaemonError> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = config::read_daemon_pid(pid_path)?;
    kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
        .map_err(|_| DaemonError::NotRunning { pid })?;
    Ok(pid)
}

/// Add a server entry to the config file, creating the file if absent.
///
/// Existing entries are never overwritten; `mcpl remove` (external) is the
/// way to drop one first. The running daemon picks new entries up on the
/// next handshake.
pub fn add_server(
    config_path: &Path,
    name: &str,
    server: ServerConfig,
) -> Result<(), DaemonError> {
    // Only a missing file starts from defaults; any other load failure
    // (bad permissions, parse error) must not clobber what is on disk.
    let mut cfg = match config::load(config_path) {
        Ok(cfg) => cfg,
        Err(mcpl_core::error::ConfigError::Io { ref source, .. })
            if source.kind() == std::io::ErrorKind::NotFound =>
        {
            Config::default()
        }
        Err(e) => return Err(e.into()),
    };
    if cfg.servers.contains_key(name) {
        return Err(DaemonError::ServerExists {
            server: name.to_string(),
        });
    }
    cfg.servers.insert(name.to_string(), server);
    cfg.save(config_path)?;
    Ok(())
}

/// Parse repeated `KEY=VALUE` flags into a subprocess environment map.
pub fn parse_env_pairs(pairs: &[String]) -> Result<HashMap<String, String>, DaemonError> {
    let mut env = HashMap::with_capacity(pairs.len());
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(DaemonError::InvalidEnvPair { pair: pair.clone() });
        };
        if key.is_empty() {
            return Err(DaemonError::InvalidEnvPair { pair: pair.clone() });
        }
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_config(command: &str) -> ServerConfig {
        ServerConfig {
            command: command.to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            serialize: false,
            managed: true,
        }
    }

    #[test]
    fn test_add_server_creates_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        add_server(&path, "mock", server_config("/bin/cat")).unwrap();

        let cfg = config::load(&path).unwrap();
        assert_eq!(cfg.servers["mock"].command, "/bin/cat");
        // Defaults come along when the file is created from scratch.
        assert_eq!(cfg.log_level.as_deref(), Some("info"));
    }

    #[test]
    fn test_add_server_appends_to_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        add_server(&path, "one", server_config("/bin/cat")).unwrap();
        add_server(&path, "two", server_config("/bin/true")).unwrap();

        let cfg = config::load(&path).unwrap();
        assert_eq!(cfg.servers.len(), 2);
        assert_eq!(cfg.servers["one"].command, "/bin/cat");
        assert_eq!(cfg.servers["two"].command, "/bin/true");
    }

    #[test]
    fn test_add_server_refuses_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        add_server(&path, "mock", server_config("/bin/cat")).unwrap();
        let err = add_server(&path, "mock", server_config("/bin/true")).unwrap_err();
        assert!(matches!(err, DaemonError::ServerExists { .. }));

        // The original entry is untouched.
        let cfg = config::load(&path).unwrap();
        assert_eq!(cfg.servers["mock"].command, "/bin/cat");
    }

    #[test]
    fn test_parse_env_pairs() {
        let env = parse_env_pairs(&[
            "TOKEN=abc".to_string(),
            "EMPTY=".to_string(),
            "EQ=a=b".to_string(),
        ])
        .unwrap();
        assert_eq!(env["TOKEN"], "abc");
        assert_eq!(env["EMPTY"], "");
        assert_eq!(env["EQ"], "a=b");

        assert!(matches!(
            parse_env_pairs(&["NOVALUE".to_string()]),
            Err(DaemonError::InvalidEnvPair { .. })
        ));
        assert!(matches!(
            parse_env_pairs(&["=x".to_string()]),
            Err(DaemonError::InvalidEnvPair { .. })
        ));
    }

    #[test]
    fn test_stop_daemon_signals_pid_from_file() {
        use std::process::Command;

        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("mcpl.pid");

        // A process of our own to signal; sleep exits on SIGTERM.
        let mut child = Command::new("/bin/sleep").arg("30").spawn().unwrap();
        std::fs::write(&pid_path, format!("{}\n", child.id())).unwrap();

        let pid = stop_daemon(&pid_path).unwrap();
        assert_eq!(pid, child.id());

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if child.try_wait().unwrap().is_some() {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "child did not exit after SIGTERM"
            );
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
    }

    #[test]
    fn test_stop_daemon_without_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = stop_daemon(&dir.path().join("mcpl.pid")).unwrap_err();
        assert!(matches!(
            err,
            DaemonError::Config(mcpl_core::error::ConfigError::Io { .. })
        ));
    }
}
