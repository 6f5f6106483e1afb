//! Network entry point.
//!
//! `listen` is the single seam through which the server starts accepting
//! connections, whether it runs as the main binary or is embedded as a
//! library. It validates nothing; the socket layer owns defaults and errors.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::task::JoinHandle;

/// A running listener.
#[derive(Debug)]
pub struct ListenHandle {
    pub local_addr: SocketAddr,
    /// Resolves when the server stops accepting connections.
    pub task: JoinHandle<anyhow::Result<()>>,
}

/// Accepts client connections. `None` arguments mean "use the layer's
/// default".
#[async_trait]
pub trait SocketLayer: Send + Sync {
    async fn listen(
        &self,
        port: Option<u16>,
        bind_address: Option<String>,
        workers: Option<usize>,
    ) -> anyhow::Result<ListenHandle>;
}

/// Starts listening through `layer`, passing the arguments through as-is.
///
/// # Errors
///
/// Whatever the socket layer reports.
pub async fn listen(
    layer: &dyn SocketLayer,
    port: Option<u16>,
    bind_address: Option<String>,
    workers: Option<usize>,
) -> anyhow::Result<ListenHandle> {
    layer.listen(port, bind_address, workers).await
}

/// Parses a command-line port argument the lenient way: optional leading
/// whitespace and sign, then as many digits as are present. Anything that
/// does not yield a port in `1..=65535` is `None`.
#[must_use]
pub fn parse_port_arg(arg: Option<&str>) -> Option<u16> {
    let arg = arg?.trim_start();
    let (negative, digits) = match arg.as_bytes().first() {
        Some(b'-') => (true, &arg[1..]),
        Some(b'+') => (false, &arg[1..]),
        _ => (false, arg),
    };
    let end = digits
        .bytes()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(digits.len());
    let digits = &digits[..end];
    if negative || digits.is_empty() {
        return None;
    }
    digits.parse::<u16>().ok().filter(|p| *p != 0)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    type Calls = Arc<Mutex<Vec<(Option<u16>, Option<String>, Option<usize>)>>>;

    struct RecordingLayer {
        calls: Calls,
    }

    #[async_trait]
    impl SocketLayer for RecordingLayer {
        async fn listen(
            &self,
            port: Option<u16>,
            bind_address: Option<String>,
            workers: Option<usize>,
        ) -> anyhow::Result<ListenHandle> {
            self.calls.lock().push((port, bind_address, workers));
            Ok(ListenHandle {
                local_addr: "127.0.0.1:1".parse()?,
                task: tokio::spawn(async { Ok(()) }),
            })
        }
    }

    #[test]
    fn port_argument_parses_leading_digits() {
        assert_eq!(parse_port_arg(Some("8000")), Some(8000));
        assert_eq!(parse_port_arg(Some("  8001abc")), Some(8001));
        assert_eq!(parse_port_arg(Some("+9000")), Some(9000));
    }

    #[test]
    fn unusable_port_arguments_fall_back() {
        assert_eq!(parse_port_arg(None), None);
        assert_eq!(parse_port_arg(Some("")), None);
        assert_eq!(parse_port_arg(Some("abc")), None);
        assert_eq!(parse_port_arg(Some("-80")), None);
        assert_eq!(parse_port_arg(Some("0")), None);
        assert_eq!(parse_port_arg(Some("70000")), None);
    }

    #[tokio::test]
    async fn listen_delegates_arguments_untouched() {
        let calls = Calls::default();
        let layer = RecordingLayer {
            calls: calls.clone(),
        };

        let handle = listen(&layer, Some(0), Some("::".to_string()), None).await.unwrap();
        handle.task.await.unwrap().unwrap();

        assert_eq!(*calls.lock(), vec![(Some(0), Some("::".to_string()), None)]);
    }
}
