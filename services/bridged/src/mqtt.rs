use crate::config::MqttConfig;
use crate::pubsub::{Correlation, InboundRequest, Publication};
use crate::topics;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::PublishProperties;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::MqttOptions;
use rumqttc::{TlsConfiguration, Transport};
use std::fs;
use std::sync::Arc;
use std::time::Duration;

const KEEPALIVE: Duration = Duration::from_secs(30);

/// Certificate verifier that accepts anything; gated behind the
/// `tls_insecure` switch for lab brokers with self-signed certificates.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

/// Builds the broker connection options from the validated config.
pub fn build_options(config: &MqttConfig, client_id: &str) -> Result<MqttOptions, String> {
    let mut options = MqttOptions::new(client_id, &config.host, config.port);
    options.set_keep_alive(KEEPALIVE);

    if let (Some(user), Some(pass)) = (&config.user, &config.pass) {
        options.set_credentials(user.clone(), pass.clone());
    }

    if config.tls {
        let transport = if config.tls_insecure {
            let tls = rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth();
            Transport::Tls(TlsConfiguration::Rustls(Arc::new(tls)))
        } else {
            let cafile = config
                .cafile
                .as_ref()
                .ok_or_else(|| "mqtt.cafile missing".to_string())?;
            let ca = fs::read(cafile).map_err(|error| format!("mqtt.cafile: {}", error))?;

            let client_auth = match (&config.certfile, &config.keyfile) {
                (Some(certfile), Some(keyfile)) => {
                    let cert =
                        fs::read(certfile).map_err(|error| format!("mqtt.certfile: {}", error))?;
                    let key =
                        fs::read(keyfile).map_err(|error| format!("mqtt.keyfile: {}", error))?;
                    Some((cert, key))
                }
                _ => None,
            };

            Transport::Tls(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth,
            })
        };

        options.set_transport(transport);
    }

    Ok(options)
}

/// The wildcard subscription under the configured prefix.
pub fn subscription(prefix: &str) -> String {
    format!("{}#", prefix)
}

pub const SUBSCRIBE_QOS: QoS = QoS::AtMostOnce;
pub const PUBLISH_QOS: QoS = QoS::AtMostOnce;

/// Maps a publication's correlation and user properties onto MQTT v5
/// publish properties.
pub fn publish_properties(publication: &Publication) -> PublishProperties {
    let mut properties = PublishProperties::default();

    properties.response_topic = publication.correlation.response_topic.clone();
    properties.correlation_data = publication
        .correlation
        .correlation_data
        .as_ref()
        .map(|data| Bytes::from(data.clone()));
    properties.user_properties = publication.properties.clone();

    properties
}

/// Parses an inbound broker publish into a request for the engine. Topics
/// outside the prefix, and the daemon's own response topics, yield `None`.
pub fn parse_incoming(
    prefix: &str,
    topic: &[u8],
    payload: &[u8],
    properties: Option<&PublishProperties>,
) -> Option<InboundRequest> {
    let topic = std::str::from_utf8(topic).ok()?;
    let suffix = topic.strip_prefix(prefix)?;

    let request = topics::parse(suffix)?;

    let correlation = match properties {
        Some(properties) => Correlation {
            response_topic: properties.response_topic.clone(),
            correlation_data: properties
                .correlation_data
                .as_ref()
                .map(|data| data.to_vec()),
        },
        None => Correlation::default(),
    };

    Some(InboundRequest {
        request,
        payload: payload.to_vec(),
        correlation,
    })
}
