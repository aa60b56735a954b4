//! # TLS Integration Tests
//!
//! In-memory handshakes against a server whose certificate follows the serving
//! provider and whose optional client authentication follows the CA provider,
//! plus one request to the TLS endpoint over a real socket.

use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use trust_controller::certauthority::{parse_certificates, CertificateAuthority};
use trust_controller::dynamic_cert::tls::server_config;
use trust_controller::dynamic_cert::DynamicCertProvider;
use trust_controller::server::serve_tls;

const DNS_NAME: &str = "api.trust.svc";
const HOUR: Duration = Duration::from_secs(3600);

struct Server {
    serving: Arc<DynamicCertProvider>,
    ca: Arc<DynamicCertProvider>,
    config: Arc<ServerConfig>,
}

fn server() -> Server {
    let serving = Arc::new(DynamicCertProvider::new_serving_cert("serving"));
    let ca = Arc::new(DynamicCertProvider::new_ca("ca"));
    let config = Arc::new(server_config(Arc::clone(&serving), Arc::clone(&ca)).unwrap());
    Server {
        serving,
        ca,
        config,
    }
}

fn client_config(ca: &CertificateAuthority) -> Arc<ClientConfig> {
    let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(ca.pool().unwrap())
        .with_no_client_auth();
    Arc::new(config)
}

/// Client trusting `server_ca` and presenting a certificate issued by `client_ca`
fn client_config_with_cert(
    server_ca: &CertificateAuthority,
    client_ca: &CertificateAuthority,
) -> Arc<ClientConfig> {
    let issued = client_ca.issue_client_cert_pem("aggregator", HOUR).unwrap();
    let chain: Vec<CertificateDer<'static>> = parse_certificates(issued.cert_pem.as_bytes())
        .unwrap()
        .into_iter()
        .map(CertificateDer::from)
        .collect();
    let key = pem::parse(issued.key_pem.as_bytes()).unwrap();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.into_contents()));

    let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(server_ca.pool().unwrap())
        .with_client_auth_cert(chain, key)
        .unwrap();
    Arc::new(config)
}

fn install_ca(provider: &DynamicCertProvider, ca: &CertificateAuthority) {
    provider
        .set_cert_key_content(&ca.bundle(), &ca.private_key_to_pem())
        .unwrap();
}

fn issue(ca: &CertificateAuthority, provider: &DynamicCertProvider) -> Vec<u8> {
    let issued = ca
        .issue_server_cert_pem(&[DNS_NAME.to_string()], &[], HOUR)
        .unwrap();
    provider
        .set_cert_key_content(issued.cert_pem.as_bytes(), issued.key_pem.as_bytes())
        .unwrap();
    parse_certificates(issued.cert_pem.as_bytes())
        .unwrap()
        .remove(0)
}

/// Certificates each side received from the other
#[derive(Debug)]
struct Handshake {
    server_cert: Vec<u8>,
    client_cert: Option<Vec<u8>>,
}

fn handshake(
    client_config: Arc<ClientConfig>,
    server_config: Arc<ServerConfig>,
) -> Result<Handshake, rustls::Error> {
    let name = ServerName::try_from(DNS_NAME).unwrap().to_owned();
    let mut client = ClientConnection::new(client_config, name)?;
    let mut server = ServerConnection::new(server_config)?;

    for _ in 0..10 {
        if !client.is_handshaking() && !server.is_handshaking() {
            break;
        }

        let mut buf = Vec::new();
        client.write_tls(&mut buf).unwrap();
        let mut rd = buf.as_slice();
        while !rd.is_empty() {
            server.read_tls(&mut rd).unwrap();
        }
        server.process_new_packets()?;

        let mut buf = Vec::new();
        server.write_tls(&mut buf).unwrap();
        let mut rd = buf.as_slice();
        while !rd.is_empty() {
            client.read_tls(&mut rd).unwrap();
        }
        client.process_new_packets()?;
    }

    let server_cert = client
        .peer_certificates()
        .and_then(|chain| chain.first())
        .map(|cert| cert.as_ref().to_vec())
        .ok_or_else(|| rustls::Error::General("no peer certificate".to_string()))?;
    let client_cert = server
        .peer_certificates()
        .and_then(|chain| chain.first())
        .map(|cert| cert.as_ref().to_vec());
    Ok(Handshake {
        server_cert,
        client_cert,
    })
}

#[test]
fn test_new_connections_see_rotated_certificate() {
    let ca = CertificateAuthority::new("tls test CA", HOUR).unwrap();
    let server = server();
    let client = client_config(&ca);

    let first = issue(&ca, &server.serving);
    let got = handshake(Arc::clone(&client), Arc::clone(&server.config)).unwrap();
    assert_eq!(got.server_cert, first);

    let second = issue(&ca, &server.serving);
    assert_ne!(first, second);
    let got = handshake(client, server.config).unwrap();
    assert_eq!(got.server_cert, second);
}

#[test]
fn test_unset_keeps_serving_previous_certificate() {
    let ca = CertificateAuthority::new("tls test CA", HOUR).unwrap();
    let server = server();
    let client = client_config(&ca);

    // Nothing was ever served, so there is nothing to fall back to
    assert!(handshake(Arc::clone(&client), Arc::clone(&server.config)).is_err());

    let served = issue(&ca, &server.serving);
    assert_eq!(
        handshake(Arc::clone(&client), Arc::clone(&server.config))
            .unwrap()
            .server_cert,
        served
    );

    server.serving.unset_cert_key_content();
    assert!(server.serving.current_cert_key_content().is_none());
    assert_eq!(handshake(client, server.config).unwrap().server_cert, served);
}

#[test]
fn test_certificate_from_another_ca_is_rejected_by_clients() {
    let trusted = CertificateAuthority::new("trusted CA", HOUR).unwrap();
    let rogue = CertificateAuthority::new("rogue CA", HOUR).unwrap();
    let server = server();

    issue(&rogue, &server.serving);
    assert!(handshake(client_config(&trusted), server.config).is_err());
}

#[test]
fn test_client_certificate_from_current_ca_is_accepted() {
    let ca = CertificateAuthority::new("tls test CA", HOUR).unwrap();
    let server = server();
    issue(&ca, &server.serving);
    install_ca(&server.ca, &ca);

    let got = handshake(client_config_with_cert(&ca, &ca), Arc::clone(&server.config)).unwrap();
    assert!(got.client_cert.is_some());

    // Client certificates stay optional
    let got = handshake(client_config(&ca), server.config).unwrap();
    assert!(got.client_cert.is_none());
}

#[test]
fn test_client_certificate_follows_ca_rotation() {
    let old_ca = CertificateAuthority::new("old CA", HOUR).unwrap();
    let new_ca = CertificateAuthority::new("new CA", HOUR).unwrap();
    let server = server();
    issue(&old_ca, &server.serving);
    install_ca(&server.ca, &old_ca);

    let old_client = client_config_with_cert(&old_ca, &old_ca);
    assert!(handshake(Arc::clone(&old_client), Arc::clone(&server.config)).is_ok());

    install_ca(&server.ca, &new_ca);
    assert!(handshake(old_client, Arc::clone(&server.config)).is_err());
    assert!(handshake(client_config_with_cert(&old_ca, &new_ca), server.config).is_ok());
}

#[test]
fn test_no_client_certificate_is_requested_without_a_ca() {
    let ca = CertificateAuthority::new("tls test CA", HOUR).unwrap();
    let server = server();
    issue(&ca, &server.serving);

    let got = handshake(client_config_with_cert(&ca, &ca), server.config).unwrap();
    assert!(got.client_cert.is_none());
}

#[tokio::test]
async fn test_tls_endpoint_answers_healthz() {
    let ca = CertificateAuthority::new("tls test CA", HOUR).unwrap();
    let server = server();
    issue(&ca, &server.serving);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(serve_tls(
        listener,
        Arc::clone(&server.config),
        shutdown.clone(),
    ));

    let stream = TcpStream::connect(addr).await.unwrap();
    let name = ServerName::try_from(DNS_NAME).unwrap().to_owned();
    let mut tls = TlsConnector::from(client_config(&ca))
        .connect(name, stream)
        .await
        .unwrap();
    tls.write_all(b"GET /healthz HTTP/1.1\r\nHost: api.trust.svc\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    let mut buf = [0u8; 1024];
    while !response.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = tls.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        response.extend_from_slice(&buf[..n]);
    }
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    drop(tls);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
