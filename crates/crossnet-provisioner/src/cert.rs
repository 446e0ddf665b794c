//! Self-signed front-end certificates

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

use crate::error::{ProvisionError, Result};

/// Validity of front-end certificates
pub const DEFAULT_VALIDITY_DAYS: u32 = 30;

pub struct SelfSignedCert {
    pub cert_pem: String,
    pub key_pem: String,
}

fn compute_validity(days: u32) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    let not_after = now + ::time::Duration::days(i64::from(days));
    (now, not_after)
}

impl SelfSignedCert {
    /// Generate a key pair and a certificate for `common_name`
    pub fn generate(common_name: &str, validity_days: u32) -> Result<Self> {
        let mut params =
            CertificateParams::new(vec![common_name.to_string()]).map_err(|e| {
                ProvisionError::Certificate(format!("invalid name {}: {}", common_name, e))
            })?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;

        let (not_before, not_after) = compute_validity(validity_days);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate()
            .map_err(|e| ProvisionError::Certificate(format!("failed to generate key: {}", e)))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| ProvisionError::Certificate(format!("failed to sign: {}", e)))?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_pem() {
        let cert = SelfSignedCert::generate("spoke1.crossnet.internal", DEFAULT_VALIDITY_DAYS)
            .unwrap();
        assert!(cert.cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(cert.key_pem.contains("PRIVATE KEY-----"));
    }
}
