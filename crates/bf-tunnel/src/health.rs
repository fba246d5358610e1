//! Remote health-check loop
//!
//! The ping endpoint is queried from the remote host itself, through the
//! same remote-exec channel used to start the service, so the check does
//! not depend on the forwarding channel that is only opened afterwards.

use std::time::Duration;

use serde::Deserialize;

use bf_core::{ExecOutput, RemoteExec, TunnelError};

#[derive(Deserialize)]
struct PingReply {
    ok: bool,
}

/// Shell one-liner fetching `/api/ping` on the remote loopback
///
/// Falls back from curl to wget to python3, whichever the host has.
pub fn ping_command(port: u16) -> String {
    let url = format!("http://127.0.0.1:{}/api/ping", port);
    format!(
        "curl -fsS --max-time 3 {url} 2>/dev/null \
         || wget -qO- -T 3 {url} 2>/dev/null \
         || python3 -c \"import urllib.request; print(urllib.request.urlopen('{url}', timeout=3).read().decode())\"",
        url = url
    )
}

fn is_healthy(output: &ExecOutput) -> bool {
    output.success()
        && output
            .stdout
            .lines()
            .filter_map(|line| serde_json::from_str::<PingReply>(line.trim()).ok())
            .any(|reply| reply.ok)
}

fn describe_failure(output: &ExecOutput) -> String {
    if output.success() {
        return format!("unexpected reply {:?}", output.stdout.trim());
    }
    match output.stderr.trim().lines().last() {
        Some(line) if !line.is_empty() => format!("exit {}: {}", output.exit_code, line),
        _ => format!("exit {}: no response", output.exit_code),
    }
}

/// Poll the remote ping endpoint until it answers `{"ok": true}`
///
/// Returns the attempt number that succeeded. A failing remote command
/// counts as one unhealthy attempt; a broken connection to the host
/// aborts the loop at once.
pub async fn wait_healthy(
    exec: &dyn RemoteExec,
    port: u16,
    attempts: u32,
    interval: Duration,
) -> Result<u32, TunnelError> {
    let attempts = attempts.max(1);
    let command = ping_command(port);
    let mut last = String::from("not attempted");

    for attempt in 1..=attempts {
        let output = exec.run(&command).await?;
        if is_healthy(&output) {
            tracing::info!(
                "Remote service on {}:{} healthy after {} attempt(s)",
                exec.host(),
                port,
                attempt
            );
            return Ok(attempt);
        }
        last = describe_failure(&output);
        tracing::debug!("Health attempt {}/{} failed: {}", attempt, attempts, last);

        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }

    Err(TunnelError::HealthCheckTimeout { attempts, last })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{exit, ok, ScriptedHost};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_healthy_after_refusals() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let host = ScriptedHost::new(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                exit(7, "curl: (7) Failed to connect: Connection refused")
            } else {
                ok("{\"ok\": true}\n")
            }
        });

        let attempt = wait_healthy(&host, 18080, 5, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(attempt, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_healthy_is_timeout() {
        let host = ScriptedHost::new(|_| ok("{\"ok\": false}"));
        let err = wait_healthy(&host, 18080, 4, Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            TunnelError::HealthCheckTimeout { attempts, last } => {
                assert_eq!(attempts, 4);
                assert!(last.contains("unexpected reply"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(host.commands().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_loss_is_not_a_timeout() {
        let host = ScriptedHost::new(|_| Err(TunnelError::Connection("reset".into())));
        let err = wait_healthy(&host, 18080, 10, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Connection(_)));
        assert_eq!(host.commands().len(), 1);
    }

    #[test]
    fn test_ping_command_targets_port() {
        let cmd = ping_command(18093);
        assert!(cmd.starts_with("curl "));
        assert!(cmd.contains("http://127.0.0.1:18093/api/ping"));
    }

    #[test]
    fn test_reply_parsing() {
        assert!(is_healthy(&ExecOutput {
            stdout: "{\"ok\":true}".into(),
            ..Default::default()
        }));
        assert!(!is_healthy(&ExecOutput {
            stdout: "<html>proxy</html>".into(),
            ..Default::default()
        }));
        assert!(!is_healthy(&ExecOutput {
            stdout: "{\"ok\":true}".into(),
            exit_code: 1,
            ..Default::default()
        }));
    }
}
