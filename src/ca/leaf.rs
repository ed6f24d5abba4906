//! Leaf certificate issuance for intercepted hosts.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyIdMethod,
    KeyPair, KeyUsagePurpose, PublicKeyData, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use time::{Duration, OffsetDateTime};
use tracing::debug;

use super::authority::RootAuthority;
use super::serial::key_id;
use super::{CaError, CaResult};

/// The subject of a leaf certificate: a DNS name or an IP address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LeafHost {
    Dns(String),
    Ip(IpAddr),
}

impl LeafHost {
    /// Normalizes a server name or `host:port` authority.
    ///
    /// Strips the port, IPv6 brackets and a trailing dot, and lowercases
    /// DNS names. An empty name aborts the handshake.
    pub fn parse(raw: &str) -> CaResult<Self> {
        let host = strip_port(raw.trim());
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        let host = host.strip_suffix('.').unwrap_or(host);

        if host.is_empty() {
            return Err(CaError::HandshakeAborted);
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Self::Ip(ip));
        }

        let valid = host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '*'));
        if !valid {
            return Err(CaError::InvalidDnsName(host.to_string()));
        }
        Ok(Self::Dns(host.to_ascii_lowercase()))
    }
}

impl fmt::Display for LeafHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dns(name) => f.write_str(name),
            Self::Ip(ip) => write!(f, "{ip}"),
        }
    }
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        // More than one colon is a bare IPv6 literal.
        Some((name, port)) if !name.contains(':') && port.parse::<u16>().is_ok() => name,
        _ => host,
    }
}

/// Validity window applied to issued leaves.
#[derive(Debug, Clone, Copy)]
pub struct LeafPolicy {
    /// How far `not_before` is backdated to tolerate client clock skew.
    pub skew: Duration,
    /// How far `not_after` lies in the future.
    pub lifetime: Duration,
}

impl Default for LeafPolicy {
    fn default() -> Self {
        Self {
            skew: Duration::hours(24),
            lifetime: Duration::hours(24),
        }
    }
}

/// A leaf certificate and its key, ready to serve.
pub struct LeafCredential {
    host: LeafHost,
    cert_der: CertificateDer<'static>,
    key_der: PrivatePkcs8KeyDer<'static>,
    serial: Vec<u8>,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
    certified_key: Arc<CertifiedKey>,
}

impl LeafCredential {
    /// Returns the host named in the SAN.
    pub fn host(&self) -> &LeafHost {
        &self.host
    }

    /// Returns the leaf certificate in DER format.
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Returns the leaf private key as PKCS#8 DER.
    pub fn key_der(&self) -> &PrivatePkcs8KeyDer<'static> {
        &self.key_der
    }

    /// The chain served to clients: leaf first, then the root.
    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.certified_key.cert
    }

    /// Big-endian serial number bytes.
    pub fn serial(&self) -> &[u8] {
        &self.serial
    }

    /// Start of validity, backdated against clock skew.
    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    /// End of validity, never later than the root's.
    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// Whether the credential stays valid for at least `margin` past `now`.
    pub fn is_fresh(&self, now: OffsetDateTime, margin: Duration) -> bool {
        now >= self.not_before && now + margin < self.not_after
    }

    /// Returns the chain and signing key for a rustls resolver.
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified_key)
    }
}

impl fmt::Debug for LeafCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafCredential")
            .field("host", &self.host)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// Issues leaf certificates signed by a [`RootAuthority`].
///
/// Holds no state besides the root and the validity policy, so issuance
/// can be called directly with any host.
#[derive(Clone)]
pub struct LeafIssuer {
    root: Arc<RootAuthority>,
    policy: LeafPolicy,
}

impl LeafIssuer {
    /// Creates an issuer signing with `root` under `policy`.
    pub fn new(root: Arc<RootAuthority>, policy: LeafPolicy) -> Self {
        Self { root, policy }
    }

    /// Returns the signing root.
    pub fn root(&self) -> &RootAuthority {
        &self.root
    }

    /// Issues a leaf for a server name or `host:port` authority.
    pub fn issue(&self, host: &str) -> CaResult<LeafCredential> {
        let host = LeafHost::parse(host)?;
        self.issue_for(&host, OffsetDateTime::now_utc())
    }

    /// Issues a leaf for an already normalized host at the given instant.
    pub fn issue_for(&self, host: &LeafHost, now: OffsetDateTime) -> CaResult<LeafCredential> {
        let san = match host {
            LeafHost::Dns(name) => SanType::DnsName(
                name.as_str()
                    .try_into()
                    .map_err(|_| CaError::InvalidDnsName(name.clone()))?,
            ),
            LeafHost::Ip(ip) => SanType::IpAddress(*ip),
        };

        let leaf_key = KeyPair::generate().map_err(CaError::KeyGeneration)?;
        let serial = self.root.serials().next_bytes()?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, self.root.organization());

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.subject_alt_names = vec![san];
        params.serial_number = Some(serial.clone().into());
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.key_identifier_method =
            KeyIdMethod::PreSpecified(key_id(&leaf_key.subject_public_key_info()));
        params.use_authority_key_identifier_extension = true;

        // Never outlive the root.
        params.not_before = now - self.policy.skew;
        params.not_after = (now + self.policy.lifetime).min(self.root.not_after());
        let (not_before, not_after) = (params.not_before, params.not_after);

        let cert = params
            .signed_by(&leaf_key, self.root.issuer())
            .map_err(CaError::Signing)?;

        let cert_der = cert.der().clone();
        let key_der = PrivatePkcs8KeyDer::from(leaf_key.serialize_der());
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&PrivateKeyDer::Pkcs8(
            key_der.clone_key(),
        ))
        .map_err(CaError::SigningKey)?;
        let chain = vec![cert_der.clone(), self.root.cert_der().clone()];

        debug!("issued leaf certificate for {}", host);

        Ok(LeafCredential {
            host: host.clone(),
            cert_der,
            key_der,
            serial,
            not_before,
            not_after,
            certified_key: Arc::new(CertifiedKey::new(chain, signing_key)),
        })
    }
}
