//! TLS configuration shared by the QUIC and the TCP transports.
use rustls::{
	client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
	crypto::{self, CryptoProvider},
	pki_types::{CertificateDer, InvalidDnsNameError, ServerName, UnixTime},
	DigitallySignedStruct, RootCertStore, SignatureScheme, SupportedProtocolVersion,
};
use std::{fs, io, path::Path, sync::Arc};

pub const DEFAULT_ALPN: &[u8] = b"mqtt";

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
	#[error(transparent)]
	Rustls(#[from] rustls::Error),
	#[error("TLS configuration has no initial QUIC cipher suite")]
	NoInitialCipherSuite(#[from] quinn::crypto::rustls::NoInitialCipherSuite),
	#[error("invalid server name: {0}")]
	InvalidServerName(#[from] InvalidDnsNameError),
	#[error("failed to read certificates: {0}")]
	Certificates(#[from] io::Error),
	#[error("no certificates found in {0}")]
	NoCertificates(String),
}

/// How the Server's certificate chain is verified.
#[derive(Clone, Debug, Default)]
pub enum Verification {
	/// Verify against the bundled Mozilla root certificates.
	#[default]
	WebPki,
	/// Verify against the given root certificates only.
	Roots(Vec<CertificateDer<'static>>),
	/// Accept any certificate. The handshake signatures are still checked.
	Insecure,
}

/// Transport security options.
#[derive(Clone, Debug)]
pub struct TlsOptions {
	/// ALPN protocol identifiers offered during the handshake.
	pub alpn_protocols: Vec<Vec<u8>>,
	pub verification: Verification,
}

impl Default for TlsOptions {
	fn default() -> Self {
		Self {
			alpn_protocols: vec![DEFAULT_ALPN.to_vec()],
			verification: Verification::default(),
		}
	}
}

impl TlsOptions {
	/// Trusts only the certificates in the PEM file at `path`.
	pub fn with_ca_file(mut self, path: impl AsRef<Path>) -> Result<Self, TlsError> {
		self.verification = Verification::Roots(load_certificates(path)?);
		Ok(self)
	}

	pub fn insecure(mut self) -> Self {
		self.verification = Verification::Insecure;
		self
	}

	/// Builds a client configuration suitable for QUIC (TLS 1.3 only).
	pub fn quic_client_config(&self) -> Result<rustls::ClientConfig, TlsError> {
		self.client_config(&[&rustls::version::TLS13])
	}

	/// Builds a client configuration for TLS over TCP.
	pub fn tcp_client_config(&self) -> Result<rustls::ClientConfig, TlsError> {
		self.client_config(rustls::ALL_VERSIONS)
	}

	fn client_config(
		&self,
		versions: &[&'static SupportedProtocolVersion],
	) -> Result<rustls::ClientConfig, TlsError> {
		let provider = Arc::new(crypto::ring::default_provider());
		let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
			.with_protocol_versions(versions)?;

		let mut config = match &self.verification {
			Verification::WebPki => {
				let mut roots = RootCertStore::empty();
				roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
				builder.with_root_certificates(roots).with_no_client_auth()
			}
			Verification::Roots(certificates) => {
				let mut roots = RootCertStore::empty();
				for certificate in certificates {
					roots.add(certificate.clone())?;
				}
				builder.with_root_certificates(roots).with_no_client_auth()
			}
			Verification::Insecure => {
				tracing::warn!("server certificate verification is disabled");
				builder
					.dangerous()
					.with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
					.with_no_client_auth()
			}
		};

		config.alpn_protocols = self.alpn_protocols.clone();
		Ok(config)
	}
}

/// Validates `host` as a TLS server name.
pub fn server_name(host: &str) -> Result<ServerName<'static>, TlsError> {
	Ok(ServerName::try_from(host.to_owned())?)
}

/// Reads every certificate from a PEM file.
pub fn load_certificates(path: impl AsRef<Path>) -> Result<Vec<CertificateDer<'static>>, TlsError> {
	let path = path.as_ref();
	let mut reader = io::BufReader::new(fs::File::open(path)?);
	let certificates = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
	if certificates.is_empty() {
		return Err(TlsError::NoCertificates(path.display().to_string()));
	}
	Ok(certificates)
}

#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
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
		let Self(provider) = self;
		crypto::verify_tls12_signature(message, cert, dss, &provider.signature_verification_algorithms)
	}

	fn verify_tls13_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		let Self(provider) = self;
		crypto::verify_tls13_signature(message, cert, dss, &provider.signature_verification_algorithms)
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		let Self(provider) = self;
		provider.signature_verification_algorithms.supported_schemes()
	}
}
