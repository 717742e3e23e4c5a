// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tpmreg Authors
use openssl::{
    asn1::Asn1Time,
    bn::{BigNum, MsbOption},
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    x509::{extension, X509Name, X509},
};
use thiserror::Error;

static LOCAL_IPS: &[&str] = &["127.0.0.1", "::1"];
static LOCAL_DNS_NAMES: &[&str] = &["localhost"];

#[derive(Error, Debug)]
pub enum CertificateBuilderError {
    /// Error getting ASN.1 Time from days from now
    #[error("failed to get ASN.1 Time for {days} day(s) from now")]
    ASN1TimeDaysFromNowError {
        days: u32,
        source: openssl::error::ErrorStack,
    },

    /// X509 certificate builder error
    #[error("X509 certificate builder error: {message}")]
    BuilderError {
        message: String,
        source: openssl::error::ErrorStack,
    },

    /// Failed to get public key from the private key
    #[error("failed to get public key from the private key")]
    PubkeyFromPrivError { source: crate::crypto::CryptoError },

    /// Common name not set on CertificateBuilder
    #[error("Common Name not set on CertificateBuilder")]
    MissingCommonNameError,

    /// Private key not set on CertificateBuilder
    #[error("Private key not set on CertificateBuilder")]
    MissingPrivateKeyError,

    /// Error creating X509 Name
    #[error("Error creating X509 Name: {message}")]
    NameBuilderError {
        message: String,
        source: openssl::error::ErrorStack,
    },
}

/// Builds test certificates, either self-signed or issued by a given CA
///
/// ```ignore
/// let ca = CertificateBuilder::new()
///     .private_key(&ca_key)
///     .common_name("test CA")
///     .certificate_authority(true)
///     .build()?;
/// let leaf = CertificateBuilder::new()
///     .private_key(&leaf_key)
///     .common_name("localhost")
///     .issuer(&ca, &ca_key)
///     .build()?;
/// ```
#[derive(Default)]
pub struct CertificateBuilder<'a> {
    ca: bool,
    common_name: Option<&'a str>,
    dns_names: Vec<&'a str>,
    ips: Vec<&'a str>,
    issuer: Option<(&'a X509, &'a PKey<Private>)>,
    not_after: Option<u32>,
    private_key: Option<&'a PKey<Private>>,
}

impl<'a> CertificateBuilder<'a> {
    pub fn new() -> CertificateBuilder<'a> {
        CertificateBuilder::default()
    }

    pub fn common_name(mut self, cn: &'a str) -> Self {
        self.common_name = Some(cn);
        self
    }

    /// The key whose public part goes into the certificate. Unless an
    /// issuer is set, it also signs the certificate.
    pub fn private_key(mut self, private_key: &'a PKey<Private>) -> Self {
        self.private_key = Some(private_key);
        self
    }

    /// Sign the certificate with the CA certificate and key
    pub fn issuer(mut self, cert: &'a X509, key: &'a PKey<Private>) -> Self {
        self.issuer = Some((cert, key));
        self
    }

    /// Mark the certificate as a CA able to sign other certificates
    pub fn certificate_authority(mut self, ca: bool) -> Self {
        self.ca = ca;
        self
    }

    /// Set the certificate expiration date, in days from now (default 365)
    pub fn not_after(mut self, days_from_now: u32) -> Self {
        self.not_after = Some(days_from_now);
        self
    }

    pub fn add_dns_names(mut self, dns_names: Vec<&'a str>) -> Self {
        self.dns_names.extend(dns_names);
        self
    }

    pub fn add_ips(mut self, ips: Vec<&'a str>) -> Self {
        self.ips.extend(ips);
        self
    }

    fn builder_err(
        message: &str,
    ) -> impl FnOnce(openssl::error::ErrorStack) -> CertificateBuilderError
    {
        let message = message.to_string();
        move |source| CertificateBuilderError::BuilderError { message, source }
    }

    /// Generate the certificate using the previously set options
    pub fn build(self) -> Result<X509, CertificateBuilderError> {
        let cn = self
            .common_name
            .ok_or(CertificateBuilderError::MissingCommonNameError)?;
        let private_key = self
            .private_key
            .ok_or(CertificateBuilderError::MissingPrivateKeyError)?;

        let mut name_builder = X509Name::builder().map_err(|source| {
            CertificateBuilderError::NameBuilderError {
                message: "failed to create X509 Name object".into(),
                source,
            }
        })?;
        name_builder
            .append_entry_by_nid(Nid::COMMONNAME, cn)
            .map_err(|source| CertificateBuilderError::NameBuilderError {
                message: "failed to set Common Name in Name builder".into(),
                source,
            })?;
        let name = name_builder.build();

        let mut builder = X509::builder().map_err(Self::builder_err(
            "failed to create X509 certificate builder object",
        ))?;

        // X.509 version 3
        builder
            .set_version(2)
            .map_err(Self::builder_err("failed to set certificate version"))?;

        let mut serial = BigNum::new()
            .map_err(Self::builder_err("failed to create serial number"))?;
        serial
            .rand(64, MsbOption::MAYBE_ZERO, false)
            .map_err(Self::builder_err("failed to randomize serial number"))?;
        let serial = serial
            .to_asn1_integer()
            .map_err(Self::builder_err("failed to encode serial number"))?;
        builder
            .set_serial_number(&serial)
            .map_err(Self::builder_err("failed to set serial number"))?;

        builder
            .set_subject_name(&name)
            .map_err(Self::builder_err("failed to set subject name"))?;
        match self.issuer {
            Some((ca_cert, _)) => builder
                .set_issuer_name(ca_cert.subject_name())
                .map_err(Self::builder_err("failed to set issuer name"))?,
            None => builder
                .set_issuer_name(&name)
                .map_err(Self::builder_err("failed to set issuer name"))?,
        }

        let pubkey = crate::crypto::pkey_pub_from_priv(private_key)
            .map_err(|source| CertificateBuilderError::PubkeyFromPrivError {
                source,
            })?;
        builder
            .set_pubkey(&pubkey)
            .map_err(Self::builder_err("failed to set public key"))?;

        let valid_from = Asn1Time::days_from_now(0).map_err(|source| {
            CertificateBuilderError::ASN1TimeDaysFromNowError {
                days: 0,
                source,
            }
        })?;
        builder
            .set_not_before(&valid_from)
            .map_err(Self::builder_err("failed to set Not Before date"))?;

        let not_after = self.not_after.unwrap_or(365);
        let valid_to =
            Asn1Time::days_from_now(not_after).map_err(|source| {
                CertificateBuilderError::ASN1TimeDaysFromNowError {
                    days: not_after,
                    source,
                }
            })?;
        builder
            .set_not_after(&valid_to)
            .map_err(Self::builder_err("failed to set Not After date"))?;

        let mut bc = extension::BasicConstraints::new();
        bc.critical();
        if self.ca {
            bc.ca();
        }
        let bc = bc
            .build()
            .map_err(Self::builder_err("failed to build BasicConstraints"))?;
        builder
            .append_extension(bc)
            .map_err(Self::builder_err("failed to append BasicConstraints"))?;

        let mut ku = extension::KeyUsage::new();
        ku.critical();
        if self.ca {
            ku.key_cert_sign().crl_sign();
        } else {
            ku.digital_signature().key_encipherment();
        }
        let ku = ku
            .build()
            .map_err(Self::builder_err("failed to build KeyUsage"))?;
        builder
            .append_extension(ku)
            .map_err(Self::builder_err("failed to append KeyUsage"))?;

        if !self.ca {
            let eku = extension::ExtendedKeyUsage::new()
                .server_auth()
                .client_auth()
                .build()
                .map_err(Self::builder_err(
                    "failed to build ExtendedKeyUsage",
                ))?;
            builder.append_extension(eku).map_err(Self::builder_err(
                "failed to append ExtendedKeyUsage",
            ))?;
        }

        let ski = extension::SubjectKeyIdentifier::new()
            .build(&builder.x509v3_context(None, None))
            .map_err(Self::builder_err(
                "failed to build SubjectKeyIdentifier",
            ))?;
        builder.append_extension(ski).map_err(Self::builder_err(
            "failed to append SubjectKeyIdentifier",
        ))?;

        if let Some((ca_cert, _)) = self.issuer {
            let aki = extension::AuthorityKeyIdentifier::new()
                .keyid(false)
                .build(&builder.x509v3_context(Some(&**ca_cert), None))
                .map_err(Self::builder_err(
                    "failed to build AuthorityKeyIdentifier",
                ))?;
            builder.append_extension(aki).map_err(Self::builder_err(
                "failed to append AuthorityKeyIdentifier",
            ))?;
        }

        // Subject Alternative Name, always covering the local addresses
        let mut san = extension::SubjectAlternativeName::new();
        for dns_name in LOCAL_DNS_NAMES.iter() {
            san.dns(dns_name);
        }
        for dns_name in
            self.dns_names.iter().filter(|n| !LOCAL_DNS_NAMES.contains(n))
        {
            san.dns(dns_name);
        }
        for ip in LOCAL_IPS.iter() {
            san.ip(ip);
        }
        for ip in self.ips.iter().filter(|i| !LOCAL_IPS.contains(i)) {
            san.ip(ip);
        }
        let san = san
            .build(&builder.x509v3_context(
                self.issuer.map(|(c, _)| &**c),
                None,
            ))
            .map_err(Self::builder_err(
                "failed to build Subject Alternative Name",
            ))?;
        builder.append_extension(san).map_err(Self::builder_err(
            "failed to append Subject Alternative Name",
        ))?;

        let signing_key = match self.issuer {
            Some((_, key)) => key,
            None => private_key,
        };
        builder
            .sign(signing_key, MessageDigest::sha256())
            .map_err(Self::builder_err("failed to sign certificate"))?;

        Ok(builder.build())
    }
}

// Unit Testing
#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::*;

    #[test]
    fn test_self_signed() {
        let (pubkey, privkey) = rsa_generate_pair(2048).unwrap(); //#[allow_ci]
        let cert = CertificateBuilder::new()
            .private_key(&privkey)
            .common_name("uuidA")
            .build()
            .unwrap(); //#[allow_ci]

        assert!(cert.public_key().unwrap().public_eq(&pubkey)); //#[allow_ci]
        assert!(cert.verify(&pubkey).unwrap()); //#[allow_ci]
        assert_eq!(cert.version(), 2);

        let ten_days_from_now = Asn1Time::days_from_now(10).unwrap(); //#[allow_ci]
        let cert = CertificateBuilder::new()
            .private_key(&privkey)
            .common_name("uuidA")
            .not_after(10)
            .build()
            .unwrap(); //#[allow_ci]
        // Could fail if the second changes between generation and now
        assert!(cert.not_after() == ten_days_from_now);
    }

    #[test]
    fn test_issued_by_ca() {
        let (ca_pub, ca_key) = rsa_generate_pair(2048).unwrap(); //#[allow_ci]
        let ca = CertificateBuilder::new()
            .private_key(&ca_key)
            .common_name("test CA")
            .certificate_authority(true)
            .build()
            .unwrap(); //#[allow_ci]

        let (leaf_pub, leaf_key) = rsa_generate_pair(2048).unwrap(); //#[allow_ci]
        let leaf = CertificateBuilder::new()
            .private_key(&leaf_key)
            .common_name("localhost")
            .issuer(&ca, &ca_key)
            .add_dns_names(vec!["registrar.example"])
            .add_ips(vec!["192.168.0.1"])
            .build()
            .unwrap(); //#[allow_ci]

        assert!(leaf.public_key().unwrap().public_eq(&leaf_pub)); //#[allow_ci]
        assert!(leaf.verify(&ca_pub).unwrap()); //#[allow_ci]
        assert!(!leaf.verify(&leaf_pub).unwrap()); //#[allow_ci]
        assert_eq!(
            leaf.issuer_name().to_der().unwrap(), //#[allow_ci]
            ca.subject_name().to_der().unwrap() //#[allow_ci]
        );

        let names = leaf.subject_alt_names().unwrap(); //#[allow_ci]
        let dns: Vec<String> = names
            .iter()
            .filter_map(|n| n.dnsname().map(|n| n.to_owned()))
            .collect();
        assert!(dns.contains(&"localhost".to_string()));
        assert!(dns.contains(&"registrar.example".to_string()));
        let ips: Vec<Vec<u8>> = names
            .iter()
            .filter_map(|n| n.ipaddress().map(|n| n.to_owned()))
            .collect();
        assert!(ips.contains(&vec![127, 0, 0, 1]));
        assert!(ips.contains(&vec![192, 168, 0, 1]));
    }

    #[test]
    fn test_missing_fields() {
        let privkey = rsa_generate(2048).unwrap(); //#[allow_ci]
        let r = CertificateBuilder::new().private_key(&privkey).build();
        assert!(matches!(
            r,
            Err(CertificateBuilderError::MissingCommonNameError)
        ));

        let r = CertificateBuilder::new().common_name("uuidA").build();
        assert!(matches!(
            r,
            Err(CertificateBuilderError::MissingPrivateKeyError)
        ));
    }
}
