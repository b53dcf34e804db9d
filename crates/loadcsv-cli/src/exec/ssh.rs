//! Secure-shell wrapping for remote instances

use super::command::CommandSpec;
use serde::Serialize;
use std::path::PathBuf;

/// Program used to reach remote instances.
pub const SSH_PROGRAM: &str = "ssh";

/// Connection options shared by every remote invocation of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SshOptions {
    /// Cipher passed with `-c`; the client default when unset
    pub cipher: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<PathBuf>,
    pub username: Option<String>,
    /// Pass `-o StrictHostKeyChecking=no`
    pub bypass_host_key_check: bool,
}

impl SshOptions {
    /// `user@host`, or just `host` without a username.
    pub fn destination(&self, host: &str) -> String {
        match &self.username {
            Some(user) => format!("{user}@{host}"),
            None => host.to_string(),
        }
    }

    /// Wrap `remote` so it runs on `host`.
    ///
    /// The remote command travels as a single argument already quoted for the remote
    /// shell, so the remote side sees exactly the argument vector of `remote`. A stdin
    /// redirection on `remote` stays on the local side and is carried over unchanged.
    pub fn wrap(&self, host: &str, remote: &CommandSpec) -> CommandSpec {
        let mut ssh = CommandSpec::new(SSH_PROGRAM)
            .opt_arg("-c", self.cipher.as_deref())
            .args(
                self.bypass_host_key_check
                    .then_some(["-o", "StrictHostKeyChecking=no"])
                    .into_iter()
                    .flatten(),
            )
            .opt_arg("-p", self.port)
            .opt_arg("-i", self.identity_file.as_ref().map(|p| p.display()))
            .arg(self.destination(host))
            .arg(remote_line(remote));
        if let Some(path) = remote.stdin_path() {
            ssh = ssh.stdin_from(path);
        }
        ssh
    }
}

fn remote_line(remote: &CommandSpec) -> String {
    super::command::join_quoted(&remote.argv())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_wrap() {
        let remote = CommandSpec::new("mkfifo").arg("/data/1/in.csv.r1.dlf");
        let ssh = SshOptions::default().wrap("node2", &remote);
        assert_eq!(ssh.argv(), vec!["ssh", "node2", "mkfifo /data/1/in.csv.r1.dlf"]);
    }

    #[test]
    fn test_full_wrap() {
        let options = SshOptions {
            cipher: Some("aes128-ctr".into()),
            port: Some(2222),
            identity_file: Some(PathBuf::from("/home/load/.ssh/id key")),
            username: Some("scidb".into()),
            bypass_host_key_check: true,
        };
        let remote = CommandSpec::new("/opt/bin/tsv2scidb")
            .args(["-d", "\\t", "-o", "/data/1/it's.dlf"])
            .stdin_from("/tmp/w/in.csv_0001");
        let ssh = options.wrap("10.0.0.2", &remote);

        assert_eq!(
            ssh.argv(),
            vec![
                "ssh",
                "-c",
                "aes128-ctr",
                "-o",
                "StrictHostKeyChecking=no",
                "-p",
                "2222",
                "-i",
                "/home/load/.ssh/id key",
                "scidb@10.0.0.2",
                "/opt/bin/tsv2scidb -d '\\t' -o '/data/1/it'\\''s.dlf'",
            ]
        );
        assert_eq!(
            ssh.stdin_path(),
            Some(std::path::Path::new("/tmp/w/in.csv_0001"))
        );
    }
}
