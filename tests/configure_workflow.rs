// End-to-end configuration workflows against a software provider
// These tests drive the plugin the way a host does, one configure call at a time

use std::fs;
use std::path::Path;

use kmip_plugin::prelude::*;

const CCA_A: Endpoint = Endpoint { unit: 0x03, subunit: 0x0039 };
const CCA_B: Endpoint = Endpoint { unit: 0x05, subunit: 0x0039 };
const EP11_A: Endpoint = Endpoint { unit: 0x0a, subunit: 0x0039 };

fn adapters() -> StaticAdapterDirectory {
    StaticAdapterDirectory::new()
        .with_adapter(CCA_A, AdapterFamily::Cca, 0x5eed)
        .with_adapter(CCA_B, AdapterFamily::Cca, 0x5eed)
        .with_adapter(EP11_A, AdapterFamily::Ep11, 0)
}

fn open(dir: &Path) -> KmipPlugin {
    let environment = PluginEnvironment::new(adapters(), SoftwareProviderFactory::new())
        .with_confirm(Confirmation::Preset(true))
        .with_hostname("zkey-host.example.com");
    KmipPlugin::with_environment(dir, false, environment).unwrap()
}

fn self_signed(output: &Path, subject: &str) -> Vec<ConfigureOption> {
    vec![
        ConfigureOption::GenerateSelfSignedCert(output.to_path_buf()),
        ConfigureOption::CertSubject(subject.to_string()),
    ]
}

#[test]
fn test_three_step_cca_configuration() {
    let dir = tempfile::tempdir().unwrap();
    KmipPlugin::bind(dir.path()).unwrap();
    let mut plugin = open(dir.path());
    let cert = dir.path().join("cert.pem");

    let status = plugin.configure(Some(&[CCA_A]), &[]).unwrap();
    assert_eq!(status, ConfigureStatus::ContinueConfiguring);

    let status = plugin
        .configure(
            None,
            &[ConfigureOption::GenerateIdentityKey("EC:secp521r1".to_string())],
        )
        .unwrap();
    assert_eq!(status, ConfigureStatus::ContinueConfiguring);

    let status = plugin.configure(None, &self_signed(&cert, "CN=test")).unwrap();
    assert_eq!(status, ConfigureStatus::Complete);

    assert!(cert.exists());
    assert!(plugin.supports_key_type("CCA-AESDATA"));
    assert!(plugin.supports_key_type("CCA-AESCIPHER"));
    assert!(!plugin.supports_key_type("EP11-AES"));

    let info = plugin.info().unwrap();
    assert_eq!(info.adapter_family, Some(AdapterFamily::Cca));
    let summary = info.client_certificate.unwrap();
    assert_eq!(summary.algorithm, CertificateAlgorithm::Ecc);
    assert!(summary.subject.contains("CN=test"));

    plugin.terminate();
}

#[test]
fn test_configuration_survives_reinitialization() {
    let dir = tempfile::tempdir().unwrap();
    let mut plugin = open(dir.path());
    let mut options = self_signed(&dir.path().join("cert.pem"), "CN=first");
    options.push(ConfigureOption::GenerateIdentityKey("EC:secp256r1".to_string()));
    assert_eq!(
        plugin.configure(Some(&[CCA_A, CCA_B]), &options).unwrap(),
        ConfigureStatus::Complete
    );
    plugin.terminate();

    let mut plugin = open(dir.path());
    assert!(plugin.is_complete());

    let csr = dir.path().join("renew.csr");
    let status = plugin
        .configure(
            None,
            &[
                ConfigureOption::GenerateCsr(csr.clone()),
                ConfigureOption::RenewCert(dir.path().join("cert.pem")),
                ConfigureOption::CsrNewHeader,
            ],
        )
        .unwrap();

    assert_eq!(status, ConfigureStatus::Complete);
    let pem = fs::read_to_string(csr).unwrap();
    assert!(pem.starts_with("-----BEGIN NEW CERTIFICATE REQUEST-----"));
}

#[test]
fn test_conflicting_adapter_families() {
    let dir = tempfile::tempdir().unwrap();
    let mut plugin = open(dir.path());
    plugin.configure(Some(&[CCA_A]), &[]).unwrap();
    let stored = fs::read_to_string(plugin.config_store().config_path()).unwrap();

    let err = plugin.configure(Some(&[EP11_A]), &[]).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidAdapter);
    assert!(plugin.last_error().unwrap().contains("EP11"));
    assert_eq!(fs::read_to_string(plugin.config_store().config_path()).unwrap(), stored);
    assert!(!plugin.supports_key_type("EP11-AES"));
}

#[test]
fn test_adopting_foreign_certificate_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut plugin = open(dir.path());
    plugin
        .configure(
            Some(&[CCA_A]),
            &self_signed(&dir.path().join("own.pem"), "CN=own"),
        )
        .unwrap();
    let before = plugin.config_store().config().client_certificate.clone();
    let installed = fs::read(&before.as_ref().unwrap().path).unwrap();

    let other_dir = tempfile::tempdir().unwrap();
    let mut other = open(other_dir.path());
    let foreign = other_dir.path().join("other.pem");
    other
        .configure(Some(&[EP11_A]), &self_signed(&foreign, "CN=other"))
        .unwrap();

    let err = plugin
        .configure(None, &[ConfigureOption::ClientCert(foreign)])
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::KeyMismatch);
    assert_eq!(
        plugin.last_error(),
        Some("The client certificate's public key does not match the identity key")
    );
    assert_eq!(plugin.config_store().config().client_certificate, before);
    assert_eq!(fs::read(&before.unwrap().path).unwrap(), installed);
}

#[test]
fn test_adopting_certificate_of_identity_key() {
    let dir = tempfile::tempdir().unwrap();
    let mut plugin = open(dir.path());
    let issued = dir.path().join("issued.pem");
    plugin
        .configure(
            Some(&[EP11_A]),
            &[
                ConfigureOption::GenerateIdentityKey("RSA:1024".to_string()),
                ConfigureOption::GenerateSelfSignedCert(issued.clone()),
                ConfigureOption::CertSubject("CN=pss".to_string()),
                ConfigureOption::CertRsaPss,
                ConfigureOption::CertDigest("sha-256".to_string()),
            ],
        )
        .unwrap();
    assert_eq!(
        plugin.info().unwrap().client_certificate.unwrap().algorithm,
        CertificateAlgorithm::RsaPss
    );

    let status = plugin
        .configure(None, &[ConfigureOption::ClientCert(issued)])
        .unwrap();

    assert_eq!(status, ConfigureStatus::Complete);
    let record = plugin.config_store().config().client_certificate.clone().unwrap();
    assert_eq!(record.algorithm, CertificateAlgorithm::RsaPss);
}

#[test]
fn test_regeneration_invalidates_certificate() {
    let dir = tempfile::tempdir().unwrap();
    let mut plugin = open(dir.path());
    plugin
        .configure(
            Some(&[CCA_A]),
            &self_signed(&dir.path().join("cert.pem"), "CN=test"),
        )
        .unwrap();
    let cert_path = plugin
        .config_store()
        .config()
        .client_certificate
        .clone()
        .unwrap()
        .path;

    let status = plugin
        .configure(
            None,
            &[ConfigureOption::GenerateIdentityKey("RSA:1024".to_string())],
        )
        .unwrap();

    assert_eq!(status, ConfigureStatus::ContinueConfiguring);
    assert!(plugin.config_store().config().client_certificate.is_none());
    assert!(!cert_path.exists());
    assert_eq!(plugin.info().unwrap().missing, vec!["client certificate"]);
}

#[test]
fn test_invalid_key_spec_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut plugin = open(dir.path());
    plugin
        .configure(
            Some(&[CCA_A]),
            &[ConfigureOption::GenerateIdentityKey("EC:secp256r1".to_string())],
        )
        .unwrap();
    let stored = fs::read_to_string(plugin.config_store().config_path()).unwrap();
    let files = fs::read_dir(dir.path()).unwrap().count();

    for spec in ["RSA:3072", "EC:brainpoolP256r1", "DSA:2048", "secp256r1"] {
        let err = plugin
            .configure(None, &[ConfigureOption::GenerateIdentityKey(spec.to_string())])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidKeySpec, "{}", spec);
    }

    assert_eq!(fs::read_to_string(plugin.config_store().config_path()).unwrap(), stored);
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), files);
}

#[test]
fn test_deconfigure_leaves_clean_directory() {
    let dir = tempfile::tempdir().unwrap();
    let mut plugin = open(dir.path());
    plugin
        .configure(
            Some(&[CCA_A]),
            &self_signed(&dir.path().join("cert.pem"), "CN=test"),
        )
        .unwrap();

    plugin.deconfigure().unwrap();

    let remaining: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(remaining, vec!["cert.pem".to_string()]);
    assert!(!plugin.is_complete());
}
