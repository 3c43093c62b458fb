//! Configure options and their translation into a checked plan.

use std::fmt;
use std::path::PathBuf;

use crate::certificate::{CertificateMode, CertificateRequest, DEFAULT_VALIDITY_DAYS};
use crate::error::{error_codes, KmsError, KmsResult};
use crate::identity::KeySpec;
use crate::provider::DigestAlgorithm;

/// One option of a `configure` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigureOption {
    /// `--gen-identity-key <spec>`
    GenerateIdentityKey(String),
    /// `--gen-csr <file>`
    GenerateCsr(PathBuf),
    /// `--gen-self-signed-cert <file>`
    GenerateSelfSignedCert(PathBuf),
    CertSubject(String),
    CertExtensions(String),
    RenewCert(PathBuf),
    CsrNewHeader,
    CertValidityDays(String),
    CertDigest(String),
    CertRsaPss,
    /// `--client-cert <file>`
    ClientCert(PathBuf),
}

impl ConfigureOption {
    pub fn long_name(&self) -> &'static str {
        match self {
            ConfigureOption::GenerateIdentityKey(_) => "gen-identity-key",
            ConfigureOption::GenerateCsr(_) => "gen-csr",
            ConfigureOption::GenerateSelfSignedCert(_) => "gen-self-signed-cert",
            ConfigureOption::CertSubject(_) => "cert-subject",
            ConfigureOption::CertExtensions(_) => "cert-extensions",
            ConfigureOption::RenewCert(_) => "renew-cert",
            ConfigureOption::CsrNewHeader => "csr-new-header",
            ConfigureOption::CertValidityDays(_) => "cert-validity-days",
            ConfigureOption::CertDigest(_) => "cert-digest",
            ConfigureOption::CertRsaPss => "cert-rsa-pss",
            ConfigureOption::ClientCert(_) => "client-cert",
        }
    }
}

impl fmt::Display for ConfigureOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigureOption::GenerateIdentityKey(value)
            | ConfigureOption::CertSubject(value)
            | ConfigureOption::CertExtensions(value)
            | ConfigureOption::CertValidityDays(value)
            | ConfigureOption::CertDigest(value) => write!(f, "--{} '{}'", self.long_name(), value),
            ConfigureOption::GenerateCsr(path)
            | ConfigureOption::GenerateSelfSignedCert(path)
            | ConfigureOption::RenewCert(path)
            | ConfigureOption::ClientCert(path) => write!(f, "--{} '{}'", self.long_name(), path.display()),
            ConfigureOption::CsrNewHeader | ConfigureOption::CertRsaPss => write!(f, "--{}", self.long_name()),
        }
    }
}

fn conflict(parameter: &str, reason: &str) -> KmsError {
    KmsError::invalid_request_with_code(parameter, reason, error_codes::CONFLICTING_OPTIONS)
}

fn only_with_generation(option: &str) -> KmsError {
    conflict(
        option,
        &format!(
            "Option '--{}' is only valid together with options '--gen-csr' or '--gen-self-signed-cert'",
            option
        ),
    )
}

/// Raw option values, at most one of each
#[derive(Debug, Default)]
struct OptionSet {
    identity_key: Option<String>,
    csr: Option<PathBuf>,
    self_signed: Option<PathBuf>,
    subject: Option<String>,
    extensions: Option<String>,
    renew: Option<PathBuf>,
    new_header: bool,
    validity_days: Option<String>,
    digest: Option<String>,
    rsa_pss: bool,
    client_cert: Option<PathBuf>,
}

fn duplicate(option: &ConfigureOption) -> KmsError {
    conflict(
        option.long_name(),
        &format!("option '--{}' is specified more than once", option.long_name()),
    )
}

fn set_once<T>(slot: &mut Option<T>, value: T, option: &ConfigureOption) -> KmsResult<()> {
    if slot.is_some() {
        return Err(duplicate(option));
    }
    *slot = Some(value);
    Ok(())
}

fn set_flag(flag: &mut bool, option: &ConfigureOption) -> KmsResult<()> {
    if *flag {
        return Err(duplicate(option));
    }
    *flag = true;
    Ok(())
}

impl OptionSet {
    fn collect(options: &[ConfigureOption]) -> KmsResult<Self> {
        let mut set = OptionSet::default();

        for option in options {
            match option {
                ConfigureOption::GenerateIdentityKey(v) => set_once(&mut set.identity_key, v.clone(), option)?,
                ConfigureOption::GenerateCsr(v) => set_once(&mut set.csr, v.clone(), option)?,
                ConfigureOption::GenerateSelfSignedCert(v) => set_once(&mut set.self_signed, v.clone(), option)?,
                ConfigureOption::CertSubject(v) => set_once(&mut set.subject, v.clone(), option)?,
                ConfigureOption::CertExtensions(v) => set_once(&mut set.extensions, v.clone(), option)?,
                ConfigureOption::RenewCert(v) => set_once(&mut set.renew, v.clone(), option)?,
                ConfigureOption::CsrNewHeader => set_flag(&mut set.new_header, option)?,
                ConfigureOption::CertValidityDays(v) => set_once(&mut set.validity_days, v.clone(), option)?,
                ConfigureOption::CertDigest(v) => set_once(&mut set.digest, v.clone(), option)?,
                ConfigureOption::CertRsaPss => set_flag(&mut set.rsa_pss, option)?,
                ConfigureOption::ClientCert(v) => set_once(&mut set.client_cert, v.clone(), option)?,
            }
        }

        Ok(set)
    }

    fn reject_certificate_options(&self) -> KmsResult<()> {
        if self.subject.is_some() {
            return Err(only_with_generation("cert-subject"));
        }
        if self.extensions.is_some() {
            return Err(only_with_generation("cert-extensions"));
        }
        if self.renew.is_some() {
            return Err(only_with_generation("renew-cert"));
        }
        if self.new_header {
            return Err(conflict(
                "csr-new-header",
                "Option '--csr-new-header' is only valid together with option '--gen-csr'",
            ));
        }
        if self.validity_days.is_some() {
            return Err(conflict(
                "cert-validity-days",
                "Option '--cert-validity-days' is only valid together with option '--gen-self-signed-cert'",
            ));
        }
        if self.digest.is_some() {
            return Err(only_with_generation("cert-digest"));
        }
        if self.rsa_pss {
            return Err(only_with_generation("cert-rsa-pss"));
        }
        Ok(())
    }

    fn certificate_request(self) -> KmsResult<Option<CertificateRequest>> {
        let (mode, output) = match (self.csr, self.self_signed) {
            (Some(_), Some(_)) => {
                return Err(conflict(
                    "gen-csr",
                    "Either option '--gen-csr' or option '--gen-self-signed-cert' can be specified",
                ))
            }
            (Some(output), None) => (CertificateMode::Csr { new_header: self.new_header }, output),
            (None, Some(output)) => {
                if self.new_header {
                    return Err(conflict(
                        "csr-new-header",
                        "Option '--csr-new-header' is only valid together with option '--gen-csr'",
                    ));
                }
                let validity_days = match self.validity_days.as_deref() {
                    Some(days) => parse_validity_days(days)?,
                    None => DEFAULT_VALIDITY_DAYS,
                };
                (CertificateMode::SelfSigned { validity_days }, output)
            }
            (None, None) => return Ok(None),
        };

        if matches!(mode, CertificateMode::Csr { .. }) && self.validity_days.is_some() {
            return Err(conflict(
                "cert-validity-days",
                "Option '--cert-validity-days' is only valid together with option '--gen-self-signed-cert'",
            ));
        }
        if self.client_cert.is_some() {
            return Err(conflict(
                "client-cert",
                "Option '--client-cert' is not valid together with options '--gen-csr' or '--gen-self-signed-cert'",
            ));
        }

        let digest = self
            .digest
            .as_deref()
            .map(str::parse::<DigestAlgorithm>)
            .transpose()?;

        Ok(Some(CertificateRequest {
            mode,
            output,
            subject: self.subject,
            extensions: self.extensions,
            renew_template: self.renew,
            digest,
            rsa_pss: self.rsa_pss,
        }))
    }
}

/// Number of days, at least one
pub fn parse_validity_days(value: &str) -> KmsResult<u32> {
    match value.trim().parse::<u32>() {
        Ok(days) if days > 0 => Ok(days),
        _ => Err(KmsError::invalid_request(
            "cert-validity-days",
            &format!("'{}' is not a valid number of days", value),
        )),
    }
}

/// The steps a `configure` call asks for, with their inputs parsed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigurePlan {
    pub identity_key: Option<KeySpec>,
    pub certificate: Option<CertificateRequest>,
    pub client_cert: Option<PathBuf>,
}

impl ConfigurePlan {
    /// Check option combinations and parse option values
    ///
    /// Files are not accessed here.
    pub fn parse(options: &[ConfigureOption]) -> KmsResult<Self> {
        let set = OptionSet::collect(options)?;

        let identity_key = set.identity_key.as_deref().map(KeySpec::parse).transpose()?;
        let client_cert = set.client_cert.clone();

        let certificate = if set.csr.is_some() || set.self_signed.is_some() {
            set.certificate_request()?
        } else {
            set.reject_certificate_options()?;
            None
        };

        Ok(Self {
            identity_key,
            certificate,
            client_cert,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.identity_key.is_none() && self.certificate.is_none() && self.client_cert.is_none()
    }
}
