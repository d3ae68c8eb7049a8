//! QUIC network channel.
//!
//! One QUIC connection and exactly one bidirectional stream per attached
//! unit. Messages are length-prefix framed codec output; the stream gives
//! in-order delivery, which the request/response pairing relies on.
//!
//! Receive is event-driven: a background task owns the receive half,
//! decodes frames, and forwards them into a bounded queue. The round loop
//! awaits that queue with a deadline instead of polling, so quinn's
//! callback threads stay decoupled from the lockstep logic. Malformed
//! messages are discarded and logged; more than [`MAX_DECODE_FAULTS`]
//! consecutive failures fails the channel.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tactus_proto::{LENGTH_PREFIX_SIZE, MAX_MESSAGE_SIZE, Message, encode_framed};
use tokio::sync::mpsc;

use crate::{ChannelState, TransportError};

/// ALPN identifier spoken on every Tactus connection.
pub const ALPN: &[u8] = b"tactus/1";

/// Consecutive malformed messages tolerated before the channel fails.
pub const MAX_DECODE_FAULTS: u32 = 3;

/// Bounded depth of the receive queue between quinn and the round loop.
const RECV_QUEUE_DEPTH: usize = 8;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_error(error: impl std::fmt::Display) -> TransportError {
    TransportError::Tls { detail: error.to_string() }
}

/// Listening side of the network transport (orchestrator role).
pub struct NetworkListener {
    endpoint: quinn::Endpoint,
}

impl NetworkListener {
    /// Bind the listener.
    ///
    /// With no certificate configured a self-signed one is generated, which
    /// is fine for development and closed test benches but nothing else.
    pub fn bind(
        addr: SocketAddr,
        certificate: Option<(&Path, &Path)>,
    ) -> Result<Self, TransportError> {
        let (chain, key) = match certificate {
            Some((cert_path, key_path)) => load_certificate(cert_path, key_path)?,
            None => {
                tracing::warn!("no TLS certificate configured, using a self-signed one");
                self_signed_certificate()?
            },
        };

        let mut crypto = rustls::ServerConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(tls_error)?
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(tls_error)?;
        crypto.alpn_protocols = vec![ALPN.to_vec()];

        let config = quinn::ServerConfig::with_crypto(Arc::new(
            QuicServerConfig::try_from(crypto).map_err(tls_error)?,
        ));
        let endpoint = quinn::Endpoint::server(config, addr)
            .map_err(|e| TransportError::Listen { detail: e.to_string() })?;

        Ok(Self { endpoint })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.endpoint.local_addr().map_err(TransportError::Io)
    }

    /// Accept the next unit connection and its single bidirectional stream.
    pub async fn accept(&self) -> Result<NetworkChannel, TransportError> {
        let incoming = self
            .endpoint
            .accept()
            .await
            .ok_or(TransportError::Listen { detail: "endpoint closed".to_owned() })?;

        let connection = incoming
            .await
            .map_err(|e| TransportError::Listen { detail: e.to_string() })?;
        tracing::debug!(peer = %connection.remote_address(), "connection accepted");

        let (send, recv) = connection
            .accept_bi()
            .await
            .map_err(|e| TransportError::Listen { detail: e.to_string() })?;

        Ok(NetworkChannel::start(connection, send, recv))
    }

    /// Stop accepting and close the endpoint.
    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"shutdown");
    }
}

/// Client-side connect options.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Bound on connection establishment; `None` means quinn's own idle
    /// handling is the only limit.
    pub timeout: Option<Duration>,
    /// PEM file holding the CA that signed the orchestrator's certificate.
    /// Absent, the server certificate is not verified (the trust model of
    /// a closed simulation bench).
    pub ca_certificate: Option<std::path::PathBuf>,
}

/// One established network channel: a connection plus its single stream.
pub struct NetworkChannel {
    connection: quinn::Connection,
    send: quinn::SendStream,
    incoming: mpsc::Receiver<Message>,
    state: ChannelState,
}

impl NetworkChannel {
    /// Connect to the orchestrator and open the stream.
    ///
    /// The returned channel is already `Connected`: the await completes
    /// only once the QUIC handshake finished, bounded by
    /// [`ConnectOptions::timeout`] so an unreachable orchestrator fails
    /// instead of hanging.
    pub async fn connect(
        addr: SocketAddr,
        server_name: &str,
        options: &ConnectOptions,
    ) -> Result<Self, TransportError> {
        let crypto = client_crypto(options)?;
        let config = quinn::ClientConfig::new(Arc::new(
            QuicClientConfig::try_from(crypto).map_err(tls_error)?,
        ));

        let bind_addr: SocketAddr = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" }
            .parse()
            .map_err(|_| TransportError::Connect { detail: "bind address".to_owned() })?;
        let mut endpoint = quinn::Endpoint::client(bind_addr)
            .map_err(|e| TransportError::Connect { detail: e.to_string() })?;
        endpoint.set_default_client_config(config);

        let connecting = endpoint
            .connect(addr, server_name)
            .map_err(|e| TransportError::Connect { detail: e.to_string() })?;

        let connection = match options.timeout {
            Some(limit) => tokio::time::timeout(limit, connecting)
                .await
                .map_err(|_| TransportError::Connect {
                    detail: format!("handshake exceeded {limit:?}"),
                })?,
            None => connecting.await,
        }
        .map_err(|e| TransportError::Connect { detail: e.to_string() })?;

        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| TransportError::Connect { detail: e.to_string() })?;

        Ok(Self::start(connection, send, recv))
    }

    /// Wrap an established connection and spawn its receive task.
    pub(crate) fn start(
        connection: quinn::Connection,
        send: quinn::SendStream,
        recv: quinn::RecvStream,
    ) -> Self {
        let (tx, incoming) = mpsc::channel(RECV_QUEUE_DEPTH);
        tokio::spawn(receive_loop(recv, tx));

        Self { connection, send, incoming, state: ChannelState::Connected }
    }

    /// Current channel state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// The peer's address.
    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Send one message, length-prefix framed.
    pub async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        if self.state != ChannelState::Connected {
            return Err(TransportError::NotConnected);
        }

        let framed = encode_framed(message);
        if let Err(error) = self.send.write_all(&framed).await {
            self.state = ChannelState::Failed;
            return Err(TransportError::Send { detail: error.to_string() });
        }
        Ok(())
    }

    /// Await the next message, bounded by `deadline`.
    ///
    /// A timeout leaves the channel usable; a closed or failed receive task
    /// marks it failed.
    pub async fn next_message(&mut self, deadline: Duration) -> Result<Message, TransportError> {
        match tokio::time::timeout(deadline, self.incoming.recv()).await {
            Err(_) => Err(TransportError::Timeout),
            Ok(None) => {
                self.state = ChannelState::Failed;
                Err(TransportError::Closed)
            },
            Ok(Some(message)) => Ok(message),
        }
    }

    /// Discard queued messages and report how many were dropped.
    ///
    /// Used by the orchestrator before each fan-out so a late response from
    /// a previous round is never attributed to the new one.
    pub fn drain(&mut self) -> usize {
        let mut dropped = 0;
        while self.incoming.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }

    /// Close the channel.
    pub fn close(&mut self) {
        self.state = ChannelState::Closing;
        let _ = self.send.finish();
        self.connection.close(0u32.into(), b"close");
        self.state = ChannelState::Closed;
    }
}

/// Read length-prefixed messages off the stream until it ends or the fault
/// threshold is crossed.
async fn receive_loop(mut recv: quinn::RecvStream, tx: mpsc::Sender<Message>) {
    let mut faults = 0u32;
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];

    loop {
        if recv.read_exact(&mut prefix).await.is_err() {
            tracing::debug!("stream ended");
            return;
        }

        let length = u32::from_le_bytes(prefix) as usize;
        if length > MAX_MESSAGE_SIZE {
            tracing::error!(length, "declared message length exceeds limit, failing channel");
            return;
        }

        let mut payload = vec![0u8; length];
        if recv.read_exact(&mut payload).await.is_err() {
            tracing::debug!("stream ended mid-message");
            return;
        }

        match Message::decode(&payload) {
            Ok(message) => {
                faults = 0;
                if tx.send(message).await.is_err() {
                    // Receiver side dropped the channel.
                    return;
                }
            },
            Err(error) => {
                faults += 1;
                tracing::warn!(%error, faults, "discarding malformed message");
                if faults > MAX_DECODE_FAULTS {
                    tracing::error!(faults, "malformed message threshold crossed");
                    return;
                }
            },
        }
    }
}

fn client_crypto(options: &ConnectOptions) -> Result<rustls::ClientConfig, TransportError> {
    let builder = rustls::ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_error)?;

    let mut crypto = match &options.ca_certificate {
        Some(ca_path) => {
            let mut roots = rustls::RootCertStore::empty();
            for cert in read_pem_certs(ca_path)? {
                roots.add(cert).map_err(tls_error)?;
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        },
        None => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
            .with_no_client_auth(),
    };
    crypto.alpn_protocols = vec![ALPN.to_vec()];
    Ok(crypto)
}

fn read_pem_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let pem = std::fs::read(path)?;
    rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(TransportError::Io)
}

fn load_certificate(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TransportError> {
    let chain = read_pem_certs(cert_path)?;
    let key_pem = std::fs::read(key_path)?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(TransportError::Io)?
        .ok_or_else(|| TransportError::Tls {
            detail: format!("no private key in {}", key_path.display()),
        })?;
    Ok((chain, key))
}

fn self_signed_certificate()
-> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TransportError> {
    let certified =
        rcgen::generate_simple_self_signed(vec!["localhost".to_owned()]).map_err(tls_error)?;
    let chain = vec![certified.cert.der().clone()];
    let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));
    Ok((chain, key))
}

/// Server certificate verifier that accepts anything.
///
/// Matches the trust model of a closed simulation bench where the
/// orchestrator runs with a generated self-signed certificate. Configure
/// [`ConnectOptions::ca_certificate`] to get real verification.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self { provider: provider() }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tactus_proto::{StepRequest, StepResponse, Value, Variable};

    use super::*;

    async fn localhost_pair() -> (NetworkChannel, NetworkChannel) {
        let listener =
            NetworkListener::bind("127.0.0.1:0".parse().unwrap(), None).unwrap();
        let addr = listener.local_addr().unwrap();

        let options = ConnectOptions {
            timeout: Some(Duration::from_secs(5)),
            ca_certificate: None,
        };
        let (server_side, client_side) = tokio::join!(
            listener.accept(),
            async {
                let mut channel =
                    NetworkChannel::connect(addr, "localhost", &options).await.unwrap();
                // The stream only exists on the wire once data flows.
                channel
                    .send(&Message::Attach(tactus_proto::Attach { unit_id: 1 }))
                    .await
                    .unwrap();
                channel
            }
        );

        (server_side.unwrap(), client_side)
    }

    #[tokio::test]
    async fn connect_and_exchange() {
        let (mut server, mut client) = localhost_pair().await;

        let attach = server.next_message(Duration::from_secs(5)).await.unwrap();
        assert_eq!(attach, Message::Attach(tactus_proto::Attach { unit_id: 1 }));

        let request = Message::StepRequest(StepRequest {
            timestep_us: 1000,
            inputs: vec![Variable::new(2, Value::Real(1.5))],
        });
        server.send(&request).await.unwrap();
        assert_eq!(client.next_message(Duration::from_secs(5)).await.unwrap(), request);

        let response = Message::StepResponse(StepResponse {
            outputs: vec![Variable::new(3, Value::String("ok".to_owned()))],
        });
        client.send(&response).await.unwrap();
        assert_eq!(server.next_message(Duration::from_secs(5)).await.unwrap(), response);
    }

    #[tokio::test]
    async fn messages_arrive_in_send_order() {
        let (mut server, mut client) = localhost_pair().await;
        let _ = server.next_message(Duration::from_secs(5)).await.unwrap();

        for timestep_us in 1..=20u64 {
            server
                .send(&Message::StepRequest(StepRequest { timestep_us, inputs: vec![] }))
                .await
                .unwrap();
        }

        for expected in 1..=20u64 {
            match client.next_message(Duration::from_secs(5)).await.unwrap() {
                Message::StepRequest(request) => assert_eq!(request.timestep_us, expected),
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn deadline_yields_timeout_without_poisoning() {
        let (mut server, mut client) = localhost_pair().await;
        let _ = server.next_message(Duration::from_secs(5)).await.unwrap();

        let result = server.next_message(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(TransportError::Timeout)), "{result:?}");
        assert_eq!(server.state(), ChannelState::Connected);

        // Still usable after the timeout.
        client
            .send(&Message::StepResponse(StepResponse { outputs: vec![] }))
            .await
            .unwrap();
        assert!(server.next_message(Duration::from_secs(5)).await.is_ok());
    }

    #[tokio::test]
    async fn peer_close_surfaces_as_closed() {
        let (mut server, mut client) = localhost_pair().await;
        let _ = server.next_message(Duration::from_secs(5)).await.unwrap();

        client.close();
        let result = server.next_message(Duration::from_secs(5)).await;
        assert!(matches!(result, Err(TransportError::Closed)), "{result:?}");
        assert_eq!(server.state(), ChannelState::Failed);
    }

    #[tokio::test]
    async fn send_after_close_is_not_connected() {
        let (_server, mut client) = localhost_pair().await;

        client.close();
        let result =
            client.send(&Message::StepResponse(StepResponse { outputs: vec![] })).await;
        assert!(matches!(result, Err(TransportError::NotConnected)), "{result:?}");
    }
}
