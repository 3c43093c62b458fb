//! Certificate extension parsing, template merging and client-auth augmentation.

use std::net::IpAddr;

use const_oid::db::rfc5280::{
    ID_CE_AUTHORITY_KEY_IDENTIFIER, ID_KP_CLIENT_AUTH, ID_KP_CODE_SIGNING, ID_KP_EMAIL_PROTECTION,
    ID_KP_OCSP_SIGNING, ID_KP_SERVER_AUTH, ID_KP_TIME_STAMPING,
};
use const_oid::AssociatedOid;
use der::asn1::{Ia5String, OctetString};
use der::flagset::FlagSet;
use der::Encode;
use sha2::{Digest, Sha256};
use spki::{ObjectIdentifier, SubjectPublicKeyInfoOwned};
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, KeyUsages, SubjectAltName, SubjectKeyIdentifier,
};
use x509_cert::ext::Extension;

use crate::error::{error_codes, KmsError, KmsResult};

const PARAMETER: &str = "cert-extensions";

fn invalid(reason: String) -> KmsError {
    KmsError::invalid_request_with_code(PARAMETER, &reason, error_codes::INVALID_EXTENSION)
}

/// An extension ready for signing, or one that depends on the public key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionEntry {
    Encoded(Extension),
    /// `subjectKeyIdentifier=hash`, resolved once the public key is known
    SubjectKeyIdentifierHash { critical: bool },
}

impl ExtensionEntry {
    pub fn oid(&self) -> ObjectIdentifier {
        match self {
            ExtensionEntry::Encoded(extension) => extension.extn_id,
            ExtensionEntry::SubjectKeyIdentifierHash { .. } => SubjectKeyIdentifier::OID,
        }
    }

    /// The final extension for a certificate with `public_key`
    pub fn resolve(&self, public_key: &SubjectPublicKeyInfoOwned) -> KmsResult<Extension> {
        match self {
            ExtensionEntry::Encoded(extension) => Ok(extension.clone()),
            ExtensionEntry::SubjectKeyIdentifierHash { critical } => {
                // RFC 7093 method 1: leftmost 160 bits of the SHA-256 of the key
                let hash = Sha256::digest(public_key.subject_public_key.raw_bytes());
                let identifier = SubjectKeyIdentifier(OctetString::new(&hash[..20])?);
                Ok(encode(&identifier, *critical)?)
            }
        }
    }
}

fn encode<T: AssociatedOid + Encode>(value: &T, critical: bool) -> der::Result<Extension> {
    Ok(Extension {
        extn_id: T::OID,
        critical,
        extn_value: OctetString::new(value.to_der()?)?,
    })
}

fn encoded<T: AssociatedOid + Encode>(name: &str, value: &T, critical: bool) -> KmsResult<ExtensionEntry> {
    encode(value, critical)
        .map(ExtensionEntry::Encoded)
        .map_err(|e| invalid(format!("failed to encode {}: {}", name, e)))
}

fn parse_key_usage(value: &str) -> KmsResult<KeyUsage> {
    let mut usages = FlagSet::<KeyUsages>::default();

    for name in value.split(',').map(str::trim) {
        let usage = match name {
            "digitalSignature" => KeyUsages::DigitalSignature,
            "nonRepudiation" | "contentCommitment" => KeyUsages::NonRepudiation,
            "keyEncipherment" => KeyUsages::KeyEncipherment,
            "dataEncipherment" => KeyUsages::DataEncipherment,
            "keyAgreement" => KeyUsages::KeyAgreement,
            "keyCertSign" => KeyUsages::KeyCertSign,
            "cRLSign" => KeyUsages::CRLSign,
            "encipherOnly" => KeyUsages::EncipherOnly,
            "decipherOnly" => KeyUsages::DecipherOnly,
            other => return Err(invalid(format!("unknown key usage '{}'", other))),
        };
        usages |= usage;
    }

    Ok(KeyUsage(usages))
}

fn parse_extended_key_usage(value: &str) -> KmsResult<ExtendedKeyUsage> {
    let usages = value
        .split(',')
        .map(str::trim)
        .map(|name| match name {
            "serverAuth" => Ok(ID_KP_SERVER_AUTH),
            "clientAuth" => Ok(ID_KP_CLIENT_AUTH),
            "codeSigning" => Ok(ID_KP_CODE_SIGNING),
            "emailProtection" => Ok(ID_KP_EMAIL_PROTECTION),
            "timeStamping" => Ok(ID_KP_TIME_STAMPING),
            "OCSPSigning" => Ok(ID_KP_OCSP_SIGNING),
            other => ObjectIdentifier::new(other)
                .map_err(|_| invalid(format!("unknown extended key usage '{}'", other))),
        })
        .collect::<KmsResult<Vec<_>>>()?;

    Ok(ExtendedKeyUsage(usages))
}

fn ia5(kind: &str, value: &str) -> KmsResult<Ia5String> {
    Ia5String::new(value).map_err(|_| invalid(format!("{} '{}' is not an IA5 string", kind, value)))
}

fn parse_general_name(item: &str) -> KmsResult<GeneralName> {
    let (kind, value) = item
        .split_once(':')
        .ok_or_else(|| invalid(format!("'{}' is not of the form TYPE:value", item)))?;
    let value = value.trim();

    match kind.trim() {
        "DNS" => Ok(GeneralName::DnsName(ia5("DNS name", value)?)),
        "email" => Ok(GeneralName::Rfc822Name(ia5("email address", value)?)),
        "URI" => Ok(GeneralName::UniformResourceIdentifier(ia5("URI", value)?)),
        "IP" => value
            .parse::<IpAddr>()
            .map(GeneralName::from)
            .map_err(|_| invalid(format!("'{}' is not an IP address", value))),
        other => Err(invalid(format!("unsupported subject alternative name type '{}'", other))),
    }
}

fn parse_basic_constraints(value: &str) -> KmsResult<BasicConstraints> {
    let mut ca = None;
    let mut path_len_constraint = None;

    for item in value.split(',').map(str::trim) {
        let (key, setting) = item
            .split_once(':')
            .ok_or_else(|| invalid(format!("'{}' is not of the form key:value", item)))?;

        if key.eq_ignore_ascii_case("CA") {
            ca = Some(match setting.trim().to_ascii_uppercase().as_str() {
                "TRUE" => true,
                "FALSE" => false,
                _ => return Err(invalid(format!("CA must be TRUE or FALSE, not '{}'", setting))),
            });
        } else if key.eq_ignore_ascii_case("pathlen") {
            path_len_constraint = Some(
                setting
                    .trim()
                    .parse::<u8>()
                    .map_err(|_| invalid(format!("invalid pathlen '{}'", setting)))?,
            );
        } else {
            return Err(invalid(format!("unknown basic constraint '{}'", key)));
        }
    }

    Ok(BasicConstraints {
        ca: ca.ok_or_else(|| invalid("basicConstraints requires CA:TRUE or CA:FALSE".to_string()))?,
        path_len_constraint,
    })
}

fn parse_entry(entry: &str) -> KmsResult<ExtensionEntry> {
    let (name, value) = entry
        .split_once('=')
        .ok_or_else(|| invalid(format!("'{}' is not of the form name=value", entry)))?;
    let name = name.trim();
    let value = value.trim();

    let (critical, value) = match value.strip_prefix("critical,") {
        Some(rest) => (true, rest.trim()),
        None => (false, value),
    };
    if value.is_empty() {
        return Err(invalid(format!("extension '{}' has no value", name)));
    }

    match name {
        "keyUsage" => encoded(name, &parse_key_usage(value)?, critical),
        "extendedKeyUsage" => encoded(name, &parse_extended_key_usage(value)?, critical),
        "subjectAltName" => {
            let names = value
                .split(',')
                .map(parse_general_name)
                .collect::<KmsResult<Vec<_>>>()?;
            encoded(name, &SubjectAltName(names), critical)
        }
        "basicConstraints" => encoded(name, &parse_basic_constraints(value)?, critical),
        "subjectKeyIdentifier" if value == "hash" => Ok(ExtensionEntry::SubjectKeyIdentifierHash { critical }),
        "subjectKeyIdentifier" => Err(invalid("subjectKeyIdentifier only supports 'hash'".to_string())),
        other => Err(invalid(format!("unsupported extension '{}'", other))),
    }
}

/// Parse a `;`-separated list of `name=[critical,]value` entries
pub fn parse_extensions(extensions: &str) -> KmsResult<Vec<ExtensionEntry>> {
    let mut entries: Vec<ExtensionEntry> = Vec::new();

    for entry in extensions.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let parsed = parse_entry(entry)?;
        if entries.iter().any(|existing| existing.oid() == parsed.oid()) {
            return Err(KmsError::invalid_request_with_code(
                PARAMETER,
                &format!("extension '{}' is specified more than once", entry),
                error_codes::DUPLICATE_ENTRY,
            ));
        }
        entries.push(parsed);
    }

    Ok(entries)
}

/// Combine template extensions with explicit ones
///
/// Key identifiers of the template are dropped. Explicit entries replace
/// template extensions with the same OID.
pub fn merge_template_extensions(template: &[Extension], explicit: Vec<ExtensionEntry>) -> Vec<ExtensionEntry> {
    let mut merged: Vec<ExtensionEntry> = template
        .iter()
        .filter(|e| e.extn_id != ID_CE_AUTHORITY_KEY_IDENTIFIER && e.extn_id != SubjectKeyIdentifier::OID)
        .filter(|e| !explicit.iter().any(|x| x.oid() == e.extn_id))
        .cloned()
        .map(ExtensionEntry::Encoded)
        .collect();

    merged.extend(explicit);
    merged
}

/// Ensure the extensions a KMIP client certificate needs are present
///
/// Adds `extendedKeyUsage=clientAuth` and `subjectAltName=DNS:<hostname>`
/// when the respective extension is missing. Existing extensions are kept
/// as they are, so applying this twice changes nothing.
pub fn augment_client_auth(extensions: &mut Vec<ExtensionEntry>, hostname: &str) -> KmsResult<()> {
    if !extensions.iter().any(|e| e.oid() == ExtendedKeyUsage::OID) {
        extensions.push(encoded(
            "extendedKeyUsage",
            &ExtendedKeyUsage(vec![ID_KP_CLIENT_AUTH]),
            false,
        )?);
    }

    if !extensions.iter().any(|e| e.oid() == SubjectAltName::OID) {
        let name = GeneralName::DnsName(ia5("hostname", hostname)?);
        extensions.push(encoded("subjectAltName", &SubjectAltName(vec![name]), false)?);
    }

    Ok(())
}
