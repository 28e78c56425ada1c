// SPDX-FileCopyrightText: The etcd-operator Authors
//
// SPDX-License-Identifier: MIT

//! Certificate and key material for clusters.
//!
//! All keys are ECDSA P-256. Certificates and keys are returned PEM encoded,
//! ready to be stored in `kubernetes.io/tls` and `kubernetes.io/ssh-auth`
//! secrets.

use anyhow::Context;
use base64::{Engine as _, engine::general_purpose};
use openssl::asn1::{Asn1Integer, Asn1Time};
use openssl::bn::{BigNum, BigNumContext, MsbOption};
use openssl::ec::{EcGroup, EcKey, PointConversionForm};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
    SubjectKeyIdentifier,
};
use openssl::x509::{X509, X509Builder, X509Name, X509NameBuilder};
use std::net::IpAddr;

const CA_VALIDITY_DAYS: u32 = 3650;
const LEAF_VALIDITY_DAYS: u32 = 365;
const SSH_KEY_TYPE: &str = "ecdsa-sha2-nistp256";
const SSH_CURVE: &str = "nistp256";

/// PEM encoded certificate and its PKCS#8 private key.
#[derive(Debug, Clone)]
pub struct CertificatePair {
    pub cert_pem: String,
    pub key_pem: String,
}

#[derive(Debug, Clone)]
pub struct SshKeyPair {
    pub private_key_pem: String,
    /// Single line in `authorized_keys` format.
    pub authorized_key: String,
}

fn generate_key() -> anyhow::Result<PKey<Private>> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    Ok(PKey::from_ec_key(EcKey::generate(&group)?)?)
}

fn common_name(cn: &str) -> anyhow::Result<X509Name> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, cn)?;
    Ok(name.build())
}

fn random_serial() -> anyhow::Result<Asn1Integer> {
    let mut serial = BigNum::new()?;
    serial.rand(127, MsbOption::MAYBE_ZERO, false)?;
    Ok(serial.to_asn1_integer()?)
}

fn base_builder(
    subject: &X509Name,
    key: &PKey<Private>,
    days: u32,
) -> anyhow::Result<X509Builder> {
    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    let serial = random_serial()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(subject)?;
    builder.set_pubkey(key)?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(days)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    Ok(builder)
}

fn pem_string(bytes: Vec<u8>) -> anyhow::Result<String> {
    String::from_utf8(bytes).context("PEM output was not UTF-8")
}

/// Creates a self-signed certificate authority named `issuer`.
pub fn create_ca(issuer: &str) -> anyhow::Result<CertificatePair> {
    let key = generate_key()?;
    let subject = common_name(issuer)?;
    let mut builder = base_builder(&subject, &key, CA_VALIDITY_DAYS)?;
    builder.set_issuer_name(&subject)?;
    builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .key_cert_sign()
            .crl_sign()
            .digital_signature()
            .build()?,
    )?;
    let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
    builder.append_extension(ski)?;
    builder.sign(&key, MessageDigest::sha256())?;

    Ok(CertificatePair {
        cert_pem: pem_string(builder.build().to_pem()?)?,
        key_pem: pem_string(key.private_key_to_pem_pkcs8()?)?,
    })
}

/// Issues a certificate for `name` signed by the given CA, usable for both
/// server and client authentication. Entries of `sans` that parse as IP
/// addresses become IP SANs, everything else DNS SANs.
pub fn create_leaf_certificate(
    name: &str,
    sans: &[String],
    ca_cert_pem: &str,
    ca_key_pem: &str,
) -> anyhow::Result<CertificatePair> {
    let ca_cert = X509::from_pem(ca_cert_pem.as_bytes()).context("invalid CA certificate")?;
    let ca_key = PKey::private_key_from_pem(ca_key_pem.as_bytes()).context("invalid CA key")?;

    let key = generate_key()?;
    let subject = common_name(name)?;
    let mut builder = base_builder(&subject, &key, LEAF_VALIDITY_DAYS)?;
    builder.set_issuer_name(ca_cert.subject_name())?;
    builder.append_extension(BasicConstraints::new().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .digital_signature()
            .key_encipherment()
            .build()?,
    )?;
    builder.append_extension(ExtendedKeyUsage::new().server_auth().client_auth().build()?)?;
    if !sans.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for entry in sans {
            match entry.parse::<IpAddr>() {
                Ok(_) => san.ip(entry),
                Err(_) => san.dns(entry),
            };
        }
        let san = san.build(&builder.x509v3_context(Some(&ca_cert), None))?;
        builder.append_extension(san)?;
    }
    let aki = AuthorityKeyIdentifier::new()
        .keyid(false)
        .build(&builder.x509v3_context(Some(&ca_cert), None))?;
    builder.append_extension(aki)?;
    builder.sign(&ca_key, MessageDigest::sha256())?;

    Ok(CertificatePair {
        cert_pem: pem_string(builder.build().to_pem()?)?,
        key_pem: pem_string(key.private_key_to_pem_pkcs8()?)?,
    })
}

fn ssh_string(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
    buf.extend_from_slice(data);
}

pub fn generate_ssh_key_pair(comment: &str) -> anyhow::Result<SshKeyPair> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    let key = EcKey::generate(&group)?;
    let mut ctx = BigNumContext::new()?;
    let point = key
        .public_key()
        .to_bytes(&group, PointConversionForm::UNCOMPRESSED, &mut ctx)?;

    let mut blob = Vec::new();
    ssh_string(&mut blob, SSH_KEY_TYPE.as_bytes());
    ssh_string(&mut blob, SSH_CURVE.as_bytes());
    ssh_string(&mut blob, &point);

    Ok(SshKeyPair {
        private_key_pem: pem_string(key.private_key_to_pem()?)?,
        authorized_key: format!(
            "{SSH_KEY_TYPE} {} {comment}",
            general_purpose::STANDARD.encode(blob)
        ),
    })
}
