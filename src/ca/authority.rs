//! Root certificate authority: load from disk or generate and persist.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyIdMethod,
    KeyPair, KeyUsagePurpose, PKCS_ECDSA_P256_SHA256, PublicKeyData,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};
use x509_parser::extensions::ParsedExtension;
use x509_parser::parse_x509_certificate;

use super::serial::{SerialGenerator, key_id};
use super::{CaError, CaResult};

const DIR_MODE: u32 = 0o700;
const CERT_MODE: u32 = 0o644;
const KEY_MODE: u32 = 0o600;

/// Subject and lifetime of a freshly generated root.
#[derive(Debug, Clone)]
pub struct RootSubject {
    pub common_name: String,
    pub organization: String,
    pub validity: Duration,
}

/// The root authority that signs every leaf.
///
/// Immutable after construction; share it behind an `Arc`.
pub struct RootAuthority {
    cert_der: CertificateDer<'static>,
    cert_pem: String,
    key_der: PrivatePkcs8KeyDer<'static>,
    key_pem: String,
    issuer: Issuer<'static, KeyPair>,
    organization: String,
    key_id: Vec<u8>,
    not_after: OffsetDateTime,
    serials: SerialGenerator,
}

impl RootAuthority {
    /// Loads the root from `cert_path`/`key_path`, or generates one and
    /// writes it there when neither file exists.
    pub fn load_or_create(
        cert_path: &Path,
        key_path: &Path,
        subject: &RootSubject,
    ) -> CaResult<Self> {
        let cert_exists = exists(cert_path)?;
        let key_exists = exists(key_path)?;

        match (cert_exists, key_exists) {
            (true, true) => {
                let root = Self::load(cert_path, key_path, &subject.organization)?;
                info!("loaded root CA from {}", cert_path.display());
                Ok(root)
            }
            (false, false) => {
                let root = Self::generate(subject)?;
                root.persist(cert_path, key_path)?;
                info!(
                    "generated root CA {:?}, saved to {}",
                    subject.common_name,
                    cert_path.display()
                );
                Ok(root)
            }
            (true, false) => Err(CaError::Incomplete(key_path.to_path_buf())),
            (false, true) => Err(CaError::Incomplete(cert_path.to_path_buf())),
        }
    }

    /// Generates a self-signed root in memory.
    pub fn generate(subject: &RootSubject) -> CaResult<Self> {
        let serials = SerialGenerator::default();
        let key_pair = KeyPair::generate().map_err(CaError::KeyGeneration)?;
        let ski = key_id(&key_pair.subject_public_key_info());

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, subject.common_name.as_str());
        dn.push(DnType::OrganizationName, subject.organization.as_str());

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(serials.next()?);
        params.key_identifier_method = KeyIdMethod::PreSpecified(ski.clone());

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::minutes(5);
        params.not_after = now + subject.validity;
        let not_after = params.not_after;

        let cert = params.self_signed(&key_pair).map_err(CaError::Signing)?;
        let cert_der = cert.der().clone();
        let cert_pem = cert.pem();
        let key_der = PrivatePkcs8KeyDer::from(key_pair.serialize_der());
        let key_pem = key_pair.serialize_pem();

        debug!("generated root CA certificate");

        Ok(Self {
            cert_der,
            cert_pem,
            key_der,
            key_pem,
            issuer: Issuer::new(params, key_pair),
            organization: subject.organization.clone(),
            key_id: ski,
            not_after,
            serials,
        })
    }

    /// Loads a root from PEM files.
    ///
    /// The key must be an ECDSA P-256 PKCS#8 key and the certificate an
    /// unexpired CA certificate for that key. `organization` is used only when the
    /// certificate subject carries none.
    pub fn load(cert_path: &Path, key_path: &Path, organization: &str) -> CaResult<Self> {
        let cert_pem = read(cert_path)?;
        let key_pem = read(key_path)?;
        Self::from_pem(&cert_pem, &key_pem, organization)
    }

    /// Parses a root from in-memory PEM.
    pub fn from_pem(cert_pem: &str, key_pem: &str, organization: &str) -> CaResult<Self> {
        let key_der = match rustls_pemfile::private_key(&mut key_pem.as_bytes()) {
            Ok(Some(PrivateKeyDer::Pkcs8(der))) => der,
            Ok(Some(_)) => return Err(CaError::InvalidKeyType("not a PKCS#8 key".into())),
            Ok(None) => return Err(CaError::InvalidKeyType("no private key found".into())),
            Err(e) => return Err(CaError::InvalidKeyType(e.to_string())),
        };
        let key_pair =
            KeyPair::from_pem(key_pem).map_err(|e| CaError::InvalidKeyType(e.to_string()))?;
        if key_pair.algorithm() != &PKCS_ECDSA_P256_SHA256 {
            return Err(CaError::InvalidKeyType(format!(
                "expected ECDSA P-256, got {:?}",
                key_pair.algorithm()
            )));
        }

        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| CaError::Parse("no certificate found".into()))?
            .map_err(|e| CaError::Parse(e.to_string()))?;

        let (_, cert) =
            parse_x509_certificate(&cert_der).map_err(|e| CaError::Parse(e.to_string()))?;
        if !cert.is_ca() {
            return Err(CaError::Parse("certificate is not a CA".into()));
        }
        match cert.key_usage() {
            Ok(Some(usage)) if !usage.value.key_cert_sign() => {
                return Err(CaError::Parse("CA key usage lacks keyCertSign".into()));
            }
            Err(e) => return Err(CaError::Parse(e.to_string())),
            _ => {}
        }
        if cert.public_key().raw != key_pair.subject_public_key_info().as_slice() {
            return Err(CaError::KeyMismatch);
        }

        let ski = cert
            .extensions()
            .iter()
            .find_map(|ext| match ext.parsed_extension() {
                ParsedExtension::SubjectKeyIdentifier(id) => Some(id.0.to_vec()),
                _ => None,
            })
            .unwrap_or_else(|| key_id(cert.public_key().raw));
        let organization = cert
            .subject()
            .iter_organization()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .unwrap_or(organization)
            .to_string();
        let not_after = OffsetDateTime::from_unix_timestamp(cert.validity().not_after.timestamp())
            .map_err(|e| CaError::Parse(e.to_string()))?;
        if not_after <= OffsetDateTime::now_utc() {
            return Err(CaError::Expired(not_after));
        }

        let issuer =
            Issuer::from_ca_cert_der(&cert_der, key_pair).map_err(|e| CaError::Parse(e.to_string()))?;

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_der,
            key_pem: key_pem.to_string(),
            issuer,
            organization,
            key_id: ski,
            not_after,
            serials: SerialGenerator::default(),
            cert_der,
        })
    }

    /// Writes certificate and key as PEM, creating parent directories.
    pub fn persist(&self, cert_path: &Path, key_path: &Path) -> CaResult<()> {
        write_pem(cert_path, &self.cert_pem, CERT_MODE)?;
        write_pem(key_path, &self.key_pem, KEY_MODE)?;
        Ok(())
    }

    /// Returns the CA certificate in DER format.
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Returns the CA certificate in PEM format.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Returns the CA private key as PKCS#8 DER.
    pub fn key_der(&self) -> &PrivatePkcs8KeyDer<'static> {
        &self.key_der
    }

    /// Organization name from the root subject; leaves use it as their CN.
    pub fn organization(&self) -> &str {
        &self.organization
    }

    /// Subject key identifier of the root.
    pub fn key_id(&self) -> &[u8] {
        &self.key_id
    }

    /// End of the root's validity; no leaf outlives it.
    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    pub(crate) fn issuer(&self) -> &Issuer<'static, KeyPair> {
        &self.issuer
    }

    pub(crate) fn serials(&self) -> &SerialGenerator {
        &self.serials
    }
}

impl std::fmt::Debug for RootAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootAuthority")
            .field("organization", &self.organization)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

fn exists(path: &Path) -> CaResult<bool> {
    path.try_exists().map_err(|source| CaError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn read(path: &Path) -> CaResult<String> {
    fs::read_to_string(path).map_err(|source| CaError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write_pem(path: &Path, contents: &str, mode: u32) -> CaResult<()> {
    let io_err = |source| CaError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        create_private_dir(parent).map_err(io_err)?;
    }

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options.open(path).map_err(io_err)?;
    file.write_all(contents.as_bytes()).map_err(io_err)?;
    file.sync_all().map_err(io_err)
}

fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(DIR_MODE)
            .create(dir)
    }
    #[cfg(not(unix))]
    {
        let _ = DIR_MODE;
        fs::create_dir_all(dir)
    }
}
