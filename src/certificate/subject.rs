//! Subject name parsing and merging.

use std::str::FromStr;

use x509_cert::attr::AttributeTypeAndValue;
use x509_cert::name::{Name, RdnSequence, RelativeDistinguishedName};

use crate::error::{error_codes, KmsError, KmsResult};

const PARAMETER: &str = "cert-subject";

fn invalid(reason: String) -> KmsError {
    KmsError::invalid_request_with_code(PARAMETER, &reason, error_codes::INVALID_SUBJECT)
}

/// Parse a `;`-separated list of `type=value` entries, e.g. `CN=test;O=Example`
///
/// Types are short names or dotted OIDs. Each type may occur only once.
pub fn parse_subject(subject: &str) -> KmsResult<Vec<AttributeTypeAndValue>> {
    let mut entries: Vec<AttributeTypeAndValue> = Vec::new();

    for entry in subject.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        match entry.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() && !value.trim().is_empty() => {}
            _ => return Err(invalid(format!("'{}' is not of the form type=value", entry))),
        }

        let atv = AttributeTypeAndValue::from_str(entry)
            .map_err(|e| invalid(format!("failed to parse '{}': {}", entry, e)))?;

        if entries.iter().any(|existing| existing.oid == atv.oid) {
            return Err(KmsError::invalid_request_with_code(
                PARAMETER,
                &format!("attribute '{}' is specified more than once", entry),
                error_codes::DUPLICATE_ENTRY,
            ));
        }
        entries.push(atv);
    }

    if entries.is_empty() {
        return Err(invalid("the subject must contain at least one entry".to_string()));
    }

    Ok(entries)
}

fn single_valued(atv: AttributeTypeAndValue) -> KmsResult<RelativeDistinguishedName> {
    RelativeDistinguishedName::try_from(vec![atv]).map_err(|e| invalid(e.to_string()))
}

/// Build a name with one RDN per entry, in the given order
pub fn build_name(entries: Vec<AttributeTypeAndValue>) -> KmsResult<Name> {
    let rdns = entries
        .into_iter()
        .map(single_valued)
        .collect::<KmsResult<Vec<_>>>()?;
    Ok(RdnSequence(rdns))
}

/// Apply explicit entries to a template name
///
/// An entry replaces the RDN holding the same attribute type, or is
/// appended when the template has none.
pub fn merge_subject(template: &Name, entries: Vec<AttributeTypeAndValue>) -> KmsResult<Name> {
    let mut rdns = template.0.clone();

    for atv in entries {
        let position = rdns
            .iter()
            .position(|rdn| rdn.0.iter().any(|existing| existing.oid == atv.oid));
        let rdn = single_valued(atv)?;

        match position {
            Some(index) => rdns[index] = rdn,
            None => rdns.push(rdn),
        }
    }

    Ok(RdnSequence(rdns))
}
