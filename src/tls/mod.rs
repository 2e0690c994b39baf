//! TLS framing adaptor di atas rustls.
//!
//! `TlsBox` duduk di antara plaintext aplikasi dan byte queue socket:
//! - Outbound: plaintext masuk `put_plaintext`, ciphertext keluar
//!   `take_ciphertext` dan menumpang jalur outbound biasa.
//! - Inbound: ciphertext dari socket masuk `put_ciphertext`, plaintext
//!   ditarik `get_plaintext` dan kembali ke generic dispatch.
//!
//! Verifikasi peer TIDAK diputuskan di sini: verifier internal menerima
//! dulu, sertifikat DER diserahkan ke aplikasi lewat event
//! `TlsVerifyPeer`, dan penolakan membatalkan sesi. rustls menjalankan
//! verifikasi di dalam state machine-nya sendiri sehingga model
//! callback-sinkron tidak bisa ditiru persis.

use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{
    ClientConfig, ClientConnection, Connection, DigitallySignedStruct, DistinguishedName,
    ServerConfig, ServerConnection, SignatureScheme,
};

use crate::error::Fault;

/// Protocol-version mask. 0 = default (dua-duanya).
pub const PROTO_TLSV1_2: u8 = 0b01;
pub const PROTO_TLSV1_3: u8 = 0b10;

/// Parameter TLS per koneksi. Set sekali sebelum `start_tls`; beku
/// setelah sesi jalan.
#[derive(Clone, Default)]
pub struct TlsParams {
    /// Private key, format PEM. Wajib untuk server mode.
    pub private_key_pem: Option<Vec<u8>>,
    /// Cert chain, format PEM. Wajib untuk server mode.
    pub cert_chain_pem: Option<Vec<u8>>,
    /// Serahkan sertifikat peer ke aplikasi lewat `TlsVerifyPeer`.
    pub verify_peer: bool,
    /// Server mode: tolak handshake kalau client tidak kirim sertifikat.
    pub fail_if_no_peer_cert: bool,
    /// SNI untuk client mode (fallback: alamat peer).
    pub sni_hostname: Option<String>,
    /// Filter cipher suite berdasarkan nama IANA
    /// (mis. "TLS13_AES_128_GCM_SHA256"). Kosong = default provider.
    pub cipher_suites: Vec<String>,
    /// Mask `PROTO_*`.
    pub protocols: u8,
}

fn protocol_versions(mask: u8) -> Vec<&'static rustls::SupportedProtocolVersion> {
    let mut versions = Vec::new();
    if mask == 0 || mask & PROTO_TLSV1_2 != 0 {
        versions.push(&rustls::version::TLS12);
    }
    if mask == 0 || mask & PROTO_TLSV1_3 != 0 {
        versions.push(&rustls::version::TLS13);
    }
    versions
}

fn build_provider(params: &TlsParams) -> Result<rustls::crypto::CryptoProvider, Fault> {
    let mut provider = rustls::crypto::ring::default_provider();
    if !params.cipher_suites.is_empty() {
        provider.cipher_suites.retain(|suite| {
            let name = format!("{:?}", suite.suite());
            params
                .cipher_suites
                .iter()
                .any(|want| want.eq_ignore_ascii_case(&name))
        });
        if provider.cipher_suites.is_empty() {
            return Err(Fault::Tls(rustls::Error::General(
                "cipher suite filter matched nothing".into(),
            )));
        }
    }
    Ok(provider)
}

fn load_cert_chain(params: &TlsParams) -> Result<Vec<CertificateDer<'static>>, Fault> {
    let pem = params
        .cert_chain_pem
        .as_deref()
        .ok_or_else(|| Fault::Tls(rustls::Error::General("missing certificate chain".into())))?;
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(Fault::Io)?;
    if certs.is_empty() {
        return Err(Fault::Tls(rustls::Error::General(
            "certificate chain PEM contained no certificates".into(),
        )));
    }
    Ok(certs)
}

fn load_private_key(params: &TlsParams) -> Result<PrivateKeyDer<'static>, Fault> {
    let pem = params
        .private_key_pem
        .as_deref()
        .ok_or_else(|| Fault::Tls(rustls::Error::General("missing private key".into())))?;
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(Fault::Io)?
        .ok_or_else(|| Fault::Tls(rustls::Error::General("private key PEM was empty".into())))
}

/// Verifier client-side yang menerima sertifikat server apa adanya.
/// Keputusan sebenarnya terjadi di aplikasi lewat `TlsVerifyPeer`.
#[derive(Debug)]
struct DeferredServerVerifier {
    supported: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for DeferredServerVerifier {
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
        verify_tls12_signature(message, cert, dss, &self.supported)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.supported)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported.supported_schemes()
    }
}

/// Verifier server-side untuk client cert; sama-sama menunda keputusan
/// ke aplikasi. `mandatory` memetakan fail-if-no-peer-cert.
#[derive(Debug)]
struct DeferredClientVerifier {
    supported: WebPkiSupportedAlgorithms,
    mandatory: bool,
}

impl ClientCertVerifier for DeferredClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.supported)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.supported)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported.supported_schemes()
    }

    fn client_auth_mandatory(&self) -> bool {
        self.mandatory
    }
}

/// Sesi TLS satu koneksi: state machine rustls plus deteksi edge
/// handshake dan serah-terima sertifikat peer.
pub struct TlsBox {
    session: Connection,
    peer_cert_taken: bool,
}

impl TlsBox {
    /// Sesi server mode dari params (cert/key wajib).
    pub fn server(params: &TlsParams) -> Result<Self, Fault> {
        let certs = load_cert_chain(params)?;
        let key = load_private_key(params)?;
        let provider = Arc::new(build_provider(params)?);
        let supported = provider.signature_verification_algorithms;

        let builder = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&protocol_versions(params.protocols))
            .map_err(Fault::Tls)?;

        let config = if params.verify_peer {
            builder
                .with_client_cert_verifier(Arc::new(DeferredClientVerifier {
                    supported,
                    mandatory: params.fail_if_no_peer_cert,
                }))
                .with_single_cert(certs, key)
                .map_err(Fault::Tls)?
        } else {
            builder
                .with_no_client_auth()
                .with_single_cert(certs, key)
                .map_err(Fault::Tls)?
        };

        let mut session = ServerConnection::new(Arc::new(config)).map_err(Fault::Tls)?;
        // Plaintext sebelum handshake selesai ditampung tanpa batas;
        // batas memori sesungguhnya ada di backpressure outbound queue.
        session.set_buffer_limit(None);
        Ok(Self {
            session: Connection::from(session),
            peer_cert_taken: false,
        })
    }

    /// Sesi client mode. `fallback_host` dipakai kalau params tidak
    /// menyebut SNI (biasanya alamat IP peer).
    pub fn client(params: &TlsParams, fallback_host: Option<String>) -> Result<Self, Fault> {
        let provider = Arc::new(build_provider(params)?);
        let supported = provider.signature_verification_algorithms;

        let builder = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&protocol_versions(params.protocols))
            .map_err(Fault::Tls)?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(DeferredServerVerifier { supported }));

        let config = match (&params.cert_chain_pem, &params.private_key_pem) {
            (Some(_), Some(_)) => {
                let certs = load_cert_chain(params)?;
                let key = load_private_key(params)?;
                builder.with_client_auth_cert(certs, key).map_err(Fault::Tls)?
            }
            _ => builder.with_no_client_auth(),
        };

        let host = params
            .sni_hostname
            .clone()
            .or(fallback_host)
            .unwrap_or_else(|| "localhost".to_string());
        let server_name = ServerName::try_from(host.clone())
            .map_err(|_| Fault::BadAddress(host))?;

        let mut session =
            ClientConnection::new(Arc::new(config), server_name).map_err(Fault::Tls)?;
        session.set_buffer_limit(None);
        Ok(Self {
            session: Connection::from(session),
            peer_cert_taken: false,
        })
    }

    /// Terima plaintext aplikasi. Selama handshake belum selesai rustls
    /// menampungnya dan baru memproduksi record setelah siap.
    pub fn put_plaintext(&mut self, data: &[u8]) -> io::Result<usize> {
        self.session.writer().write(data)
    }

    /// Masih ada record TLS yang siap dikirim ke wire?
    pub fn can_get_ciphertext(&self) -> bool {
        self.session.wants_write()
    }

    /// Tarik SEMUA ciphertext yang siap kirim. Vec kosong = tidak ada.
    pub fn take_ciphertext(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        while self.session.wants_write() {
            self.session.write_tls(&mut out)?;
        }
        Ok(out)
    }

    /// Suapkan ciphertext dari wire dan proses record yang utuh.
    /// Error di sini = kegagalan protokol; caller meng-abort sesi.
    pub fn put_ciphertext(&mut self, mut data: &[u8]) -> Result<(), rustls::Error> {
        while !data.is_empty() {
            match self.session.read_tls(&mut data) {
                Ok(0) => break,
                Ok(_) => {}
                // Reader slice tidak pernah gagal; defensive break saja.
                Err(_) => break,
            }
        }
        self.session.process_new_packets().map(|_| ())
    }

    /// Tarik plaintext yang sudah terbuka. 0 = belum ada (atau sesi
    /// selesai; penutupan socket ditangani jalur read biasa).
    pub fn get_plaintext(&mut self, buf: &mut [u8]) -> usize {
        match self.session.reader().read(buf) {
            Ok(n) => n,
            Err(_) => 0,
        }
    }

    pub fn is_handshake_completed(&self) -> bool {
        !self.session.is_handshaking()
    }

    /// Sertifikat peer (end-entity, DER), sekali saja setelah handshake.
    pub fn take_peer_cert(&mut self) -> Option<Vec<u8>> {
        if self.peer_cert_taken || self.session.is_handshaking() {
            return None;
        }
        self.peer_cert_taken = true;
        self.session
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.as_ref().to_vec())
    }

    /// Nama cipher suite yang dinegosiasikan (debug format IANA).
    pub fn cipher_name(&self) -> Option<String> {
        self.session
            .negotiated_cipher_suite()
            .map(|s| format!("{:?}", s.suite()))
    }

    /// Versi protokol yang dinegosiasikan.
    pub fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        self.session.protocol_version()
    }
}
