//! TCP dialing shared by health checks and proxy connections.
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;

/// SO_LINGER applied to shorten TIME-WAIT buildup under churn.
const LINGER: Duration = Duration::from_secs(1);

/// Dials `addr` within `timeout`, shortening TIME-WAIT where the platform
/// exposes the option and silently falling back to a plain socket otherwise.
pub(crate) async fn dial(addr: &str, timeout: Duration) -> io::Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
    let _ = stream.set_linger(Some(LINGER));
    Ok(stream)
}
