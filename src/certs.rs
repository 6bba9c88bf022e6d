//! Root CA lifecycle and per-host leaf certificate issuance.
//!
//! The root is either loaded from PEM files or generated at startup. Leaves
//! are minted on demand for each MITM'd host and cached for the lifetime of
//! the process; entries never change once a reader has observed them.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rsa::pkcs8::EncodePrivateKey;
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::errors::{Error, Result};

/// Leaf certificate validity in days (1 year).
const LEAF_TTL_DAYS: i64 = 365;
/// Root certificate validity in days (10 years).
const ROOT_TTL_DAYS: i64 = 3650;
/// Offset for not_before timestamps to handle clock skew (60 seconds).
const NOT_BEFORE_OFFSET: i64 = 60;
/// RSA modulus size for generated keys.
const RSA_KEY_BITS: usize = 2048;

/// A TLS identity: the presented chain (leaf first, root last) plus the
/// leaf's private key.
pub struct TlsIdentity {
  /// Certificate chain in presentation order.
  pub chain: Vec<CertificateDer<'static>>,
  /// Private key matching the leaf.
  pub key: PrivateKeyDer<'static>,
}

impl Clone for TlsIdentity {
  fn clone(&self) -> Self {
    Self {
      chain: self.chain.clone(),
      key: self.key.clone_key(),
    }
  }
}

fn generate_rsa_key_pair() -> Result<KeyPair> {
  let key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_BITS)
    .map_err(|e| Error::certificate(format!("failed to generate RSA key: {e}")))?;
  let der = key
    .to_pkcs8_der()
    .map_err(|e| Error::certificate(format!("failed to encode RSA key: {e}")))?;
  KeyPair::try_from(der.as_bytes())
    .map_err(|e| Error::certificate(format!("failed to load RSA key pair: {e}")))
}

/// The signing root, loaded from disk or generated at startup.
pub struct RootAuthority {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
}

impl RootAuthority {
  /// Generate a fresh root: RSA-2048, CA constraint, cert-sign and CRL-sign
  /// usages, ten-year validity. Returns the authority together with the
  /// certificate and private-key PEM strings for the operator to save.
  pub fn generate() -> Result<(Self, String, String)> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Proxy Vibes Root CA");
    dn.push(DnType::OrganizationName, "Proxy Vibes");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(ROOT_TTL_DAYS);

    let key_pair = generate_rsa_key_pair()?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate(format!("failed to self-sign root CA: {e}")))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();
    let ca_cert_der = CertificateDer::from(cert.der().to_vec());

    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate(format!("failed to create issuer: {e}")))?;

    Ok((
      Self {
        issuer,
        ca_cert_der,
      },
      cert_pem,
      key_pem,
    ))
  }

  /// Load the root from a PEM certificate and a PKCS#8 PEM private key.
  pub fn load(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
    let cert_pem = std::fs::read_to_string(cert_path.as_ref())
      .map_err(|e| Error::certificate(format!("failed to read CA certificate: {e}")))?;
    let key_pem = std::fs::read_to_string(key_path.as_ref())
      .map_err(|e| Error::certificate(format!("failed to read CA key: {e}")))?;

    let key_pair = KeyPair::from_pem(&key_pem)
      .map_err(|e| Error::certificate(format!("failed to parse CA key: {e}")))?;
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate(format!("failed to create issuer from CA cert: {e}")))?;

    let ca_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate("no certificate found in PEM"))?
      .map_err(|e| Error::certificate(format!("failed to parse PEM: {e}")))?;

    Ok(Self {
      issuer,
      ca_cert_der,
    })
  }

  /// The root certificate in DER form, as appended to every minted chain.
  pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
    &self.ca_cert_der
  }

  /// Mint a leaf for `host`: CN=host, SAN covering the host (DNS name, or
  /// both IP and DNS for address literals), one-year validity, server-auth
  /// extended usage, signed by this root.
  fn sign_leaf(&self, host: &str) -> Result<TlsIdentity> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;

    params.subject_alt_names = if let Ok(ip) = host.parse::<IpAddr>() {
      let mut sans = vec![SanType::IpAddress(ip)];
      if let Ok(dns_name) = host.try_into() {
        sans.push(SanType::DnsName(dns_name));
      }
      sans
    } else {
      vec![SanType::DnsName(host.try_into().map_err(|_| {
        Error::certificate(format!("invalid domain name: {host}"))
      })?)]
    };

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::days(LEAF_TTL_DAYS);
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let key_pair = generate_rsa_key_pair()?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate(format!("failed to sign leaf for {host}: {e}")))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate("failed to serialize leaf key"))?;

    Ok(TlsIdentity {
      chain: vec![cert_der, self.ca_cert_der.clone()],
      key: key_der,
    })
  }
}

/// Per-host leaf cache over a [`RootAuthority`].
///
/// Insert-only: concurrent first issuance for the same host may race, but the
/// entry installed first wins and is what every caller sees afterwards.
pub struct CertificateStore {
  authority: RootAuthority,
  cache: RwLock<HashMap<String, TlsIdentity>>,
}

impl CertificateStore {
  /// Wrap a root authority with an empty cache.
  pub fn new(authority: RootAuthority) -> Self {
    Self {
      authority,
      cache: RwLock::new(HashMap::new()),
    }
  }

  /// Return the cached identity for `host`, minting one on first use.
  pub fn issue(&self, host: &str) -> Result<TlsIdentity> {
    {
      let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
      if let Some(identity) = cache.get(host) {
        return Ok(identity.clone());
      }
    }
    let fresh = self.authority.sign_leaf(host)?;
    let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
    Ok(cache.entry(host.to_string()).or_insert(fresh).clone())
  }

  /// The underlying root authority.
  pub fn authority(&self) -> &RootAuthority {
    &self.authority
  }
}
