#![forbid(unsafe_code)]

//! Per-flow interception: classify, terminate TLS, parse HTTP/1.x,
//! enforce policy, replay upstream, stream the response back.

use crate::classify::{classify, Classification, CLASSIFY_MAX_PEEK};
use crate::flow::FlowChannel;
use crate::http::{
    synthetic_response, write_request_head, write_response_head, BodyMode, HttpRequestHead,
    HttpResponseHead, ParseOutcome,
};
use crate::secrets::{scan_for_leaks, substitute_placeholders};
use crate::tls::ca::CertificateAuthority;
use crate::tls::cache::CertCache;
use crate::tls::sni::extract_client_hello;
use crate::upstream::{UpstreamClient, UpstreamConn};
use crate::InterceptError;
use gondolin_policy::{Admission, Policy, RequestHead, ResponseSummary};
use rustls::ServerConnection;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

/// TLS fatal alert `access_denied(49)`, sent before resetting a flow
/// whose SNI fails admission.
const TLS_ALERT_ACCESS_DENIED: [u8; 7] = [0x15, 0x03, 0x03, 0x00, 0x02, 0x02, 0x31];

const MAX_REDIRECT_HOPS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// Identity of one guest flow as the stack classified it.
#[derive(Debug, Clone)]
pub struct FlowContext {
    pub flow: u32,
    /// Hostname behind the synthetic destination address.
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct InterceptorConfig {
    pub classify_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    pub head_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_head_bytes: usize,
    pub max_buffered_body_bytes: usize,
    pub cert_cache_capacity: usize,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            classify_timeout: Duration::from_secs(5),
            tls_handshake_timeout: Duration::from_secs(30),
            head_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            max_head_bytes: 64 * 1024,
            max_buffered_body_bytes: 8 * 1024 * 1024,
            cert_cache_capacity: 256,
        }
    }
}

pub struct Interceptor {
    pub policy: Policy,
    admission: Admission,
    ca: CertificateAuthority,
    cert_cache: Mutex<CertCache>,
    pub upstream: UpstreamClient,
    cfg: InterceptorConfig,
}

impl Interceptor {
    pub fn new(
        policy: Policy,
        ca: CertificateAuthority,
        upstream: UpstreamClient,
        cfg: InterceptorConfig,
    ) -> Self {
        let admission = policy.admission();
        Self {
            cert_cache: Mutex::new(CertCache::new(cfg.cert_cache_capacity)),
            policy,
            admission,
            ca,
            upstream,
            cfg,
        }
    }

    /// The CA certificate for the guest trust store.
    pub fn ca_cert_pem(&self) -> &str {
        self.ca.ca_cert_pem()
    }

    pub fn ca_cert_der(&self) -> &rustls_pki_types::CertificateDer<'static> {
        self.ca.ca_cert_der()
    }

    /// Secret environment exported into the guest.
    pub fn guest_env(&self) -> HashMap<String, String> {
        self.policy.secrets.guest_env()
    }

    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    /// Serve one classified-from-scratch flow to completion.
    pub async fn serve_flow(self: Arc<Self>, ctx: FlowContext, mut chan: FlowChannel) {
        let mut prefix: Vec<u8> = Vec::new();
        let verdict = loop {
            match classify(&prefix) {
                Classification::NeedMoreData if prefix.len() < CLASSIFY_MAX_PEEK => {
                    match tokio::time::timeout(self.cfg.classify_timeout, chan.read()).await {
                        Ok(Some(chunk)) => prefix.extend_from_slice(&chunk),
                        Ok(None) => return,
                        Err(_) => break Classification::Other,
                    }
                }
                Classification::NeedMoreData => break Classification::Other,
                verdict => break verdict,
            }
        };

        let result = match verdict {
            Classification::PlaintextHttp => {
                let io = GuestIo::Plain(chan);
                self.serve_http(&ctx, io, prefix, Scheme::Http).await
            }
            Classification::Tls => self.serve_tls(&ctx, chan, prefix).await,
            Classification::Other | Classification::NeedMoreData => {
                tracing::debug!(flow = ctx.flow, host = %ctx.host, "unclassifiable flow, resetting");
                chan.abort();
                return;
            }
        };

        if let Err(err) = result {
            tracing::debug!(flow = ctx.flow, host = %ctx.host, "flow ended: {err}");
        }
    }

    async fn serve_tls(
        &self,
        ctx: &FlowContext,
        mut chan: FlowChannel,
        mut prefix: Vec<u8>,
    ) -> Result<(), InterceptError> {
        let deadline = tokio::time::Instant::now() + self.cfg.tls_handshake_timeout;

        // Collect the full ClientHello to learn the SNI.
        let hello = loop {
            match extract_client_hello(&prefix) {
                Ok(Some(hello)) => break hello,
                Ok(None) => {
                    if prefix.len() > self.cfg.max_head_bytes {
                        chan.abort();
                        return Err(InterceptError::BadRequest("oversized ClientHello"));
                    }
                    match tokio::time::timeout_at(deadline, chan.read()).await {
                        Ok(Some(chunk)) => prefix.extend_from_slice(&chunk),
                        Ok(None) => return Err(InterceptError::GuestClosed),
                        Err(_) => {
                            chan.abort();
                            return Err(InterceptError::Timeout);
                        }
                    }
                }
                Err(reason) => {
                    chan.abort();
                    return Err(InterceptError::BadRequest(reason));
                }
            }
        };
        let sni = hello.sni.unwrap_or_else(|| ctx.host.clone());

        // Admission runs against a fresh host resolution before we are
        // willing to handshake at all.
        let admitted = match self.upstream.resolver_ips(&sni).await {
            Ok(ips) => ips.iter().any(|ip| self.admission.admit(&sni, *ip).is_allowed()),
            Err(_) => false,
        };
        if !admitted {
            let _ = chan.write(TLS_ALERT_ACCESS_DENIED.to_vec()).await;
            chan.abort();
            return Err(InterceptError::AdmissionDenied {
                host: sni,
                decision: gondolin_policy::AdmitDecision::DenyHost,
            });
        }

        let leaf = {
            let mut cache = self.cert_cache.lock().expect("cert cache mutex poisoned");
            cache.get_or_mint(&sni, &self.ca)?
        };
        let conn = ServerConnection::new(leaf.server_config.clone())?;

        // Drive the handshake over the flow channel.
        let mut tls = TlsGuest { conn, chan };
        tls.feed(&prefix)?;
        tls.flush_pending().await?;
        while tls.conn.is_handshaking() {
            match tokio::time::timeout_at(deadline, tls.chan.read()).await {
                Ok(Some(chunk)) => {
                    tls.feed(&chunk)?;
                    tls.flush_pending().await?;
                }
                Ok(None) => return Err(InterceptError::GuestClosed),
                Err(_) => {
                    tls.chan.abort();
                    return Err(InterceptError::Timeout);
                }
            }
        }

        // Plaintext that rode in with the handshake tail.
        let initial = tls.drain_plaintext();
        let ctx = FlowContext {
            flow: ctx.flow,
            host: sni,
            port: ctx.port,
        };
        self.serve_http(&ctx, GuestIo::Tls(Box::new(tls)), initial, Scheme::Https)
            .await
    }

    /// The keep-alive request loop over one plaintext byte stream.
    async fn serve_http(
        &self,
        ctx: &FlowContext,
        mut io: GuestIo,
        initial: Vec<u8>,
        scheme: Scheme,
    ) -> Result<(), InterceptError> {
        let mut buf = initial;
        let mut upstream_conn: Option<UpstreamConn> = None;

        loop {
            // Read the next request head; idle timeout governs the wait
            // for its first byte, the head timeout the rest.
            let head = match self.read_request_head(&mut io, &mut buf).await {
                Ok(Some(head)) => head,
                Ok(None) => {
                    io.shutdown().await;
                    return Ok(());
                }
                Err(err) => {
                    let _ = io.write(&synthetic_response(400, "Bad Request", "bad request")).await;
                    io.shutdown().await;
                    return Err(err);
                }
            };

            let mut response_started = false;
            match self
                .handle_request(
                    ctx,
                    &mut io,
                    &mut buf,
                    scheme,
                    head,
                    &mut upstream_conn,
                    &mut response_started,
                )
                .await
            {
                Ok(true) => continue,
                Ok(false) => {
                    io.shutdown().await;
                    return Ok(());
                }
                Err(err) if err.keeps_connection() && !response_started => {
                    tracing::debug!(flow = ctx.flow, "request failed: {err}");
                    io.write(&synthetic_response(502, "Bad Gateway", blocked_body(&err)))
                        .await?;
                    continue;
                }
                Err(err) => {
                    if !response_started {
                        let _ = io
                            .write(&synthetic_response(502, "Bad Gateway", "bad gateway"))
                            .await;
                    }
                    io.shutdown().await;
                    return Err(err);
                }
            }
        }
    }

    async fn read_request_head(
        &self,
        io: &mut GuestIo,
        buf: &mut Vec<u8>,
    ) -> Result<Option<HttpRequestHead>, InterceptError> {
        let idle_deadline = tokio::time::Instant::now() + self.cfg.idle_timeout;
        let mut head_deadline: Option<tokio::time::Instant> = None;
        loop {
            match HttpRequestHead::parse(buf)? {
                ParseOutcome::Done(head, head_len) => {
                    buf.drain(..head_len);
                    return Ok(Some(head));
                }
                ParseOutcome::Incomplete => {}
            }
            if buf.len() > self.cfg.max_head_bytes {
                return Err(InterceptError::HeadTooLarge);
            }
            let deadline = match head_deadline {
                Some(d) => d,
                None if buf.is_empty() => idle_deadline,
                None => {
                    let d = tokio::time::Instant::now() + self.cfg.head_timeout;
                    head_deadline = Some(d);
                    d
                }
            };
            match tokio::time::timeout_at(deadline, io.read()).await {
                Ok(Ok(Some(chunk))) => buf.extend_from_slice(&chunk),
                Ok(Ok(None)) => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    return Err(InterceptError::BadRequest("truncated request head"));
                }
                Ok(Err(err)) => return Err(err),
                Err(_) if buf.is_empty() => return Ok(None),
                Err(_) => return Err(InterceptError::Timeout),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_request(
        &self,
        ctx: &FlowContext,
        io: &mut GuestIo,
        buf: &mut Vec<u8>,
        scheme: Scheme,
        parsed: HttpRequestHead,
        upstream_conn: &mut Option<UpstreamConn>,
        response_started: &mut bool,
    ) -> Result<bool, InterceptError> {
        let guest_keep_alive = parsed.keep_alive();
        let body_mode = match parsed.body_mode() {
            Ok(mode) => mode,
            Err(err) => return Err(err),
        };

        // Reconstruct the absolute URL from scheme, Host, and target.
        let mut head = build_request_record(&parsed, scheme, &ctx.host, ctx.port)?;

        let policy_result = self.apply_request_policy(&mut head);
        let mut body = match policy_result {
            Ok(()) => {
                if self.policy.hooks.on_request.is_some() {
                    // Buffered-body path: the hook contract.
                    let mut body = self.read_full_body(io, buf, body_mode).await?;
                    if let Some(hook) = &self.policy.hooks.on_request {
                        hook.on_request(&mut head, &mut body)?;
                        // Re-check after the hook rewrote things.
                        let target_host = host_of(&head)?;
                        scan_for_leaks(&head, &target_host, &self.policy)?;
                    }
                    Some(body)
                } else {
                    match body_mode {
                        BodyMode::None => Some(Vec::new()),
                        // Bounded buffering keeps blocked-request
                        // draining and redirects simple; interception is
                        // for API traffic, not bulk uploads.
                        _ => Some(self.read_full_body(io, buf, body_mode).await?),
                    }
                }
            }
            Err(err) if err.keeps_connection() => {
                // Consume the request body so keep-alive survives the 502.
                self.read_full_body(io, buf, body_mode).await?;
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let target_host = host_of(&head)?;
        substitute_placeholders(&mut head, &target_host, &self.policy)?;

        let mut hops = 0usize;
        loop {
            let target_host = host_of(&head)?;
            let url = Url::parse(&head.url).map_err(|_| InterceptError::BadRequest("bad URL"))?;
            let tls = url.scheme() == "https";
            let port = url
                .port()
                .unwrap_or(if tls { 443 } else { 80 });

            // Re-resolve and re-admit per connect: rebinding defence.
            let mut conn = match upstream_conn.take() {
                Some(conn) if conn.matches(&target_host, port, tls) => conn,
                Some(mut stale) => {
                    stale.shutdown().await;
                    self.upstream
                        .open(&target_host, port, tls, &self.admission)
                        .await?
                }
                None => {
                    self.upstream
                        .open(&target_host, port, tls, &self.admission)
                        .await?
                }
            };

            let body_bytes = body.take().unwrap_or_default();
            let outcome = self
                .exchange(ctx, io, &head, &body_bytes, &mut conn, response_started)
                .await;
            let response = match outcome {
                Ok(response) => response,
                Err(err) => {
                    conn.shutdown().await;
                    return Err(err);
                }
            };

            match response {
                Exchange::Redirect { location, reusable } => {
                    if reusable {
                        *upstream_conn = Some(conn);
                    } else {
                        conn.shutdown().await;
                    }
                    hops += 1;
                    if hops > MAX_REDIRECT_HOPS {
                        return Err(InterceptError::RequestBlocked {
                            reason: "redirect limit exceeded".to_string(),
                        });
                    }
                    head = redirect_request(&head, &location)?;
                    let redirected_host = host_of(&head)?;
                    scan_for_leaks(&head, &redirected_host, &self.policy)?;
                    substitute_placeholders(&mut head, &redirected_host, &self.policy)?;
                    body = Some(Vec::new());
                    continue;
                }
                Exchange::Complete {
                    reusable,
                    guest_can_continue,
                } => {
                    if reusable {
                        *upstream_conn = Some(conn);
                    } else {
                        conn.shutdown().await;
                    }
                    return Ok(guest_keep_alive && guest_can_continue);
                }
            }
        }
    }

    /// Head hook, request gate, and the leak scan, in that order.
    fn apply_request_policy(&self, head: &mut RequestHead) -> Result<(), InterceptError> {
        if let Some(hook) = &self.policy.hooks.on_request_head {
            hook.on_request_head(head)?;
        }
        if let Some(gate) = &self.policy.hooks.request_gate {
            if !gate.is_request_allowed(head)? {
                return Err(InterceptError::HookDenied);
            }
        }
        let target_host = host_of(head)?;
        scan_for_leaks(head, &target_host, &self.policy)?;
        Ok(())
    }

    /// Read (and de-frame) a whole request body into memory, bounded.
    async fn read_full_body(
        &self,
        io: &mut GuestIo,
        buf: &mut Vec<u8>,
        mode: BodyMode,
    ) -> Result<Vec<u8>, InterceptError> {
        let cap = self.cfg.max_buffered_body_bytes;
        match mode {
            BodyMode::None | BodyMode::CloseDelimited => Ok(Vec::new()),
            BodyMode::ContentLength(len) => {
                if len as usize > cap {
                    return Err(InterceptError::BodyTooLarge);
                }
                while buf.len() < len as usize {
                    match io.read().await? {
                        Some(chunk) => buf.extend_from_slice(&chunk),
                        None => return Err(InterceptError::BadRequest("truncated body")),
                    }
                }
                let body: Vec<u8> = buf.drain(..len as usize).collect();
                Ok(body)
            }
            BodyMode::Chunked => {
                let mut body = Vec::new();
                loop {
                    let (size, line_len) = loop {
                        match crate::http::decode_chunk_size(buf)? {
                            Some(parsed) => break parsed,
                            None => match io.read().await? {
                                Some(chunk) => buf.extend_from_slice(&chunk),
                                None => {
                                    return Err(InterceptError::BadRequest("truncated chunk"))
                                }
                            },
                        }
                    };
                    if body.len() + size as usize > cap {
                        return Err(InterceptError::BodyTooLarge);
                    }
                    // chunk data + CRLF
                    let needed = line_len + size as usize + 2;
                    while buf.len() < needed {
                        match io.read().await? {
                            Some(chunk) => buf.extend_from_slice(&chunk),
                            None => return Err(InterceptError::BadRequest("truncated chunk")),
                        }
                    }
                    body.extend_from_slice(&buf[line_len..line_len + size as usize]);
                    buf.drain(..needed);
                    if size == 0 {
                        // Trailers are not forwarded; the terminal chunk's
                        // CRLF was consumed above.
                        break;
                    }
                }
                Ok(body)
            }
        }
    }

    /// Send one request upstream and stream the response to the guest.
    #[allow(clippy::too_many_arguments)]
    async fn exchange(
        &self,
        ctx: &FlowContext,
        io: &mut GuestIo,
        head: &RequestHead,
        body: &[u8],
        conn: &mut UpstreamConn,
        response_started: &mut bool,
    ) -> Result<Exchange, InterceptError> {
        let url = Url::parse(&head.url).map_err(|_| InterceptError::BadRequest("bad URL"))?;
        let mut target = url.path().to_string();
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }

        // Rewrite framing and host headers to match what we actually send.
        let mut headers: Vec<(String, String)> = head
            .headers
            .iter()
            .filter(|(name, _)| {
                !name.eq_ignore_ascii_case("Content-Length")
                    && !name.eq_ignore_ascii_case("Transfer-Encoding")
                    && !name.eq_ignore_ascii_case("Host")
                    && !name.eq_ignore_ascii_case("Connection")
                    // The body is already buffered in full, so never ask
                    // upstream to wait for a 100.
                    && !name.eq_ignore_ascii_case("Expect")
            })
            .cloned()
            .collect();
        let host_value = match (url.host_str(), url.port()) {
            (Some(h), Some(p)) => format!("{h}:{p}"),
            (Some(h), None) => h.to_string(),
            (None, _) => return Err(InterceptError::BadRequest("URL without host")),
        };
        headers.insert(0, ("Host".to_string(), host_value));
        if !body.is_empty() || matches!(head.method.as_str(), "POST" | "PUT" | "PATCH") {
            headers.push(("Content-Length".to_string(), body.len().to_string()));
        }

        let deadline = tokio::time::Instant::now() + self.upstream.request_timeout;
        let wire_head = write_request_head(&head.method, &target, &headers);
        tokio::time::timeout_at(deadline, conn.write_all(&wire_head))
            .await
            .map_err(|_| InterceptError::Timeout)??;
        if !body.is_empty() {
            tokio::time::timeout_at(deadline, conn.write_all(body))
                .await
                .map_err(|_| InterceptError::Timeout)??;
        }

        // Response head; interim 1xx responses are skipped.
        let response = loop {
            match HttpResponseHead::parse(&conn.buf)? {
                ParseOutcome::Done(response, head_len) => {
                    conn.buf.drain(..head_len);
                    if response.status / 100 == 1 {
                        continue;
                    }
                    break response;
                }
                ParseOutcome::Incomplete => {
                    let n = tokio::time::timeout_at(deadline, conn.fill())
                        .await
                        .map_err(|_| InterceptError::Timeout)??;
                    if n == 0 {
                        conn.reusable = false;
                        return Err(InterceptError::Upstream(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "upstream closed before response head",
                        )));
                    }
                }
            }
        };

        if let Some(hook) = &self.policy.hooks.on_response {
            hook.on_response(&ResponseSummary {
                status: response.status,
                headers: response.headers.clone(),
            })?;
        }

        let body_mode = response.body_mode(&head.method)?;
        let upstream_keep_alive = response.keep_alive() && body_mode != BodyMode::CloseDelimited;
        conn.reusable = upstream_keep_alive;

        // Follow the redirect instead of forwarding it?
        if self.upstream.follow_redirects
            && matches!(response.status, 301 | 302 | 303 | 307 | 308)
            && matches!(head.method.as_str(), "GET" | "HEAD")
        {
            if let Some(location) = response.header("Location").map(str::to_string) {
                self.drain_response_body(conn, body_mode, deadline).await?;
                tracing::debug!(flow = ctx.flow, status = response.status, %location, "following redirect");
                return Ok(Exchange::Redirect {
                    location,
                    reusable: conn.reusable,
                });
            }
        }

        // Forward the head; strip hop-by-hop headers, re-add framing.
        let mut out_headers: Vec<(String, String)> = response
            .headers
            .iter()
            .filter(|(name, _)| {
                !name.eq_ignore_ascii_case("Connection")
                    && !name.eq_ignore_ascii_case("Transfer-Encoding")
                    && !name.eq_ignore_ascii_case("Keep-Alive")
            })
            .cloned()
            .collect();
        let guest_can_continue = body_mode != BodyMode::CloseDelimited;
        match body_mode {
            BodyMode::CloseDelimited => {
                out_headers.push(("Connection".to_string(), "close".to_string()));
            }
            BodyMode::Chunked => {
                out_headers.push(("Transfer-Encoding".to_string(), "chunked".to_string()));
            }
            _ => {}
        }
        *response_started = true;
        io.write(&write_response_head(
            response.status,
            &response.reason,
            &out_headers,
        ))
        .await?;

        // Body passthrough, preserving framing on the guest side.
        match body_mode {
            BodyMode::None => {}
            BodyMode::ContentLength(len) => {
                let mut remaining = len as usize;
                while remaining > 0 {
                    if conn.buf.is_empty() {
                        let n = tokio::time::timeout_at(deadline, conn.fill())
                            .await
                            .map_err(|_| InterceptError::Timeout)??;
                        if n == 0 {
                            conn.reusable = false;
                            return Err(InterceptError::Upstream(std::io::Error::new(
                                std::io::ErrorKind::UnexpectedEof,
                                "upstream closed mid-body",
                            )));
                        }
                    }
                    let take = conn.buf.len().min(remaining);
                    let chunk: Vec<u8> = conn.buf.drain(..take).collect();
                    remaining -= take;
                    io.write(&chunk).await?;
                }
            }
            BodyMode::Chunked => {
                self.pump_chunked(io, conn, deadline).await?;
            }
            BodyMode::CloseDelimited => loop {
                if conn.buf.is_empty() {
                    let n = tokio::time::timeout_at(deadline, conn.fill())
                        .await
                        .map_err(|_| InterceptError::Timeout)??;
                    if n == 0 {
                        break;
                    }
                }
                let chunk: Vec<u8> = conn.buf.drain(..).collect();
                io.write(&chunk).await?;
            },
        }

        Ok(Exchange::Complete {
            reusable: conn.reusable,
            guest_can_continue,
        })
    }

    /// Forward a chunked body verbatim, detecting the terminal chunk.
    async fn pump_chunked(
        &self,
        io: &mut GuestIo,
        conn: &mut UpstreamConn,
        deadline: tokio::time::Instant,
    ) -> Result<(), InterceptError> {
        loop {
            let (size, line_len) = loop {
                match crate::http::decode_chunk_size(&conn.buf)? {
                    Some(parsed) => break parsed,
                    None => {
                        let n = tokio::time::timeout_at(deadline, conn.fill())
                            .await
                            .map_err(|_| InterceptError::Timeout)??;
                        if n == 0 {
                            conn.reusable = false;
                            return Err(InterceptError::Upstream(std::io::Error::new(
                                std::io::ErrorKind::UnexpectedEof,
                                "upstream closed mid-chunk",
                            )));
                        }
                    }
                }
            };
            let needed = line_len + size as usize + 2;
            while conn.buf.len() < needed {
                let n = tokio::time::timeout_at(deadline, conn.fill())
                    .await
                    .map_err(|_| InterceptError::Timeout)??;
                if n == 0 {
                    conn.reusable = false;
                    return Err(InterceptError::Upstream(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "upstream closed mid-chunk",
                    )));
                }
            }
            let wire: Vec<u8> = conn.buf.drain(..needed).collect();
            io.write(&wire).await?;
            if size == 0 {
                return Ok(());
            }
        }
    }

    async fn drain_response_body(
        &self,
        conn: &mut UpstreamConn,
        mode: BodyMode,
        deadline: tokio::time::Instant,
    ) -> Result<(), InterceptError> {
        match mode {
            BodyMode::None => Ok(()),
            BodyMode::ContentLength(len) => {
                let mut remaining = len as usize;
                while remaining > 0 {
                    if conn.buf.is_empty() {
                        let n = tokio::time::timeout_at(deadline, conn.fill())
                            .await
                            .map_err(|_| InterceptError::Timeout)??;
                        if n == 0 {
                            conn.reusable = false;
                            return Ok(());
                        }
                    }
                    let take = conn.buf.len().min(remaining);
                    conn.buf.drain(..take);
                    remaining -= take;
                }
                Ok(())
            }
            BodyMode::Chunked | BodyMode::CloseDelimited => {
                // Not worth replaying through: drop the connection.
                conn.reusable = false;
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptor")
            .field("policy", &self.policy)
            .field("cfg", &self.cfg)
            .finish_non_exhaustive()
    }
}

enum Exchange {
    Complete {
        reusable: bool,
        guest_can_continue: bool,
    },
    Redirect {
        location: String,
        reusable: bool,
    },
}

fn blocked_body(err: &InterceptError) -> &'static str {
    match err {
        InterceptError::RequestBlocked { .. }
        | InterceptError::AdmissionDenied { .. }
        | InterceptError::HookDenied
        | InterceptError::Hook(_) => "request blocked",
        _ => "bad gateway",
    }
}

fn host_of(head: &RequestHead) -> Result<String, InterceptError> {
    let url = Url::parse(&head.url).map_err(|_| InterceptError::BadRequest("bad URL"))?;
    url.host_str()
        .map(|h| h.trim_end_matches('.').to_ascii_lowercase())
        .ok_or(InterceptError::BadRequest("URL without host"))
}

/// Reconstruct the absolute URL for one parsed request.
fn build_request_record(
    parsed: &HttpRequestHead,
    scheme: Scheme,
    flow_host: &str,
    flow_port: u16,
) -> Result<RequestHead, InterceptError> {
    let url = if parsed.target.starts_with("http://") || parsed.target.starts_with("https://") {
        // Absolute-form target wins outright.
        parsed.target.clone()
    } else {
        let authority = parsed
            .header("Host")
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| {
                if flow_port == scheme.default_port() {
                    flow_host.to_string()
                } else {
                    format!("{flow_host}:{flow_port}")
                }
            });
        let target = if parsed.target.starts_with('/') {
            parsed.target.clone()
        } else {
            format!("/{}", parsed.target)
        };
        format!("{}://{}{}", scheme.as_str(), authority, target)
    };
    // Validate early so later stages can unwrap the parse.
    Url::parse(&url).map_err(|_| InterceptError::BadRequest("unparseable request URL"))?;

    Ok(RequestHead {
        method: parsed.method.clone(),
        url,
        headers: parsed.headers.clone(),
    })
}

fn redirect_request(head: &RequestHead, location: &str) -> Result<RequestHead, InterceptError> {
    let base = Url::parse(&head.url).map_err(|_| InterceptError::BadRequest("bad URL"))?;
    let next = base
        .join(location)
        .map_err(|_| InterceptError::BadRequest("bad redirect Location"))?;
    if next.scheme() != "http" && next.scheme() != "https" {
        return Err(InterceptError::BadRequest("redirect to non-HTTP scheme"));
    }
    Ok(RequestHead {
        method: head.method.clone(),
        url: next.to_string(),
        headers: head
            .headers
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case("Host"))
            .cloned()
            .collect(),
    })
}

/// One guest-side plaintext byte stream: either the raw flow or the
/// decrypted inside of the MITM TLS session.
enum GuestIo {
    Plain(FlowChannel),
    Tls(Box<TlsGuest>),
}

impl GuestIo {
    async fn read(&mut self) -> Result<Option<Vec<u8>>, InterceptError> {
        match self {
            GuestIo::Plain(chan) => Ok(chan.read().await),
            GuestIo::Tls(tls) => tls.read_plaintext().await,
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), InterceptError> {
        match self {
            GuestIo::Plain(chan) => chan.write(data.to_vec()).await,
            GuestIo::Tls(tls) => tls.write_plaintext(data).await,
        }
    }

    async fn shutdown(&mut self) {
        match self {
            GuestIo::Plain(chan) => chan.shutdown(),
            GuestIo::Tls(tls) => {
                tls.conn.send_close_notify();
                let _ = tls.flush_pending().await;
                tls.chan.shutdown();
            }
        }
    }
}

/// rustls server session pumped by hand over the flow channel; the guest
/// side of the stack is not a socket, so the sans-IO API is the natural
/// fit.
struct TlsGuest {
    conn: ServerConnection,
    chan: FlowChannel,
}

impl TlsGuest {
    /// Feed ciphertext from the guest into the session.
    fn feed(&mut self, mut bytes: &[u8]) -> Result<(), InterceptError> {
        while !bytes.is_empty() {
            let n = self.conn.read_tls(&mut bytes)?;
            if n == 0 {
                break;
            }
            self.conn
                .process_new_packets()
                .map_err(InterceptError::Tls)?;
        }
        Ok(())
    }

    /// Push any pending ciphertext out to the guest.
    async fn flush_pending(&mut self) -> Result<(), InterceptError> {
        while self.conn.wants_write() {
            let mut out = Vec::new();
            self.conn.write_tls(&mut out)?;
            if out.is_empty() {
                break;
            }
            self.chan.write(out).await?;
        }
        Ok(())
    }

    fn drain_plaintext(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut reader = self.conn.reader();
        let mut chunk = [0u8; 16 * 1024];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&chunk[..n]),
                Err(_) => break,
            }
        }
        out
    }

    async fn read_plaintext(&mut self) -> Result<Option<Vec<u8>>, InterceptError> {
        loop {
            let ready = self.drain_plaintext();
            if !ready.is_empty() {
                return Ok(Some(ready));
            }
            match self.chan.read().await {
                Some(chunk) => {
                    self.feed(&chunk)?;
                    // Handshake or alert traffic may want a reply.
                    self.flush_pending().await?;
                }
                None => return Ok(None),
            }
        }
    }

    async fn write_plaintext(&mut self, data: &[u8]) -> Result<(), InterceptError> {
        self.conn
            .writer()
            .write_all(data)
            .map_err(|_| InterceptError::GuestClosed)?;
        self.flush_pending().await
    }
}
