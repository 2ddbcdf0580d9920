//! Accept loops for the client and server ports.

use std::io;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::node::Node;
use crate::session::{self, Role};

/// Accept connections forever, running each as a session of `role`.
/// Only a failure to read the local address ends the loop.
pub async fn serve(node: Arc<Node>, listener: TcpListener, role: Role) -> io::Result<()> {
    let local = listener.local_addr()?;
    info!(%local, ?role, "Listening");
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(%local, error = %e, "Accept failed");
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "Could not disable Nagle");
        }
        let handle = session::spawn_inbound(node.clone(), Box::new(stream), role);
        debug!(%peer, session = handle.id(), ?role, "Connection accepted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::node;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn accepted_client_gets_stream_header() {
        let node = node(&["a.example"]);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(node, listener, Role::Client));

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(
            b"<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' \
              to='a.example' version='1.0'>",
        )
        .await
        .unwrap();

        let mut seen = String::new();
        let mut buf = [0u8; 1024];
        while !seen.contains("</stream:features>") {
            let n = tokio::time::timeout(Duration::from_secs(5), conn.read(&mut buf)).await.unwrap().unwrap();
            assert!(n > 0);
            seen.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        assert!(seen.contains("from='a.example'"));
        assert!(seen.contains("<mechanism>PLAIN</mechanism>"));
    }
}
