//! Binding of the plugin to one provider endpoint.

use spki::SubjectPublicKeyInfoOwned;

use super::{CryptoProvider, KeyBlob, ProviderFactory, SignatureScheme};
use crate::adapter::{cross_check_master_keys, format_endpoints, AdapterDirectory, AdapterFamily, Endpoint};
use crate::error::{KmsError, KmsResult};

/// How an endpoint is chosen from the configured set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    /// Verify the master key setup of all endpoints, then take the first
    /// online endpoint in sorted order
    CrossChecked,
    /// Try the endpoints in the given order and take the first that opens
    FirstAvailable,
}

impl SelectionStrategy {
    pub fn for_family(family: AdapterFamily) -> Self {
        match family {
            AdapterFamily::Cca => SelectionStrategy::CrossChecked,
            AdapterFamily::Ep11 => SelectionStrategy::FirstAvailable,
        }
    }
}

/// Holds at most one open provider
#[derive(Default)]
pub struct ProviderBinding {
    provider: Option<Box<dyn CryptoProvider>>,
}

impl ProviderBinding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_bound(&self) -> bool {
        self.provider.is_some()
    }

    pub fn bound_endpoint(&self) -> Option<Endpoint> {
        self.provider.as_ref().map(|p| p.endpoint())
    }

    /// Bind to one of `endpoints`, replacing any existing binding
    ///
    /// On failure the binding is left unbound.
    pub fn bind(
        &mut self,
        family: AdapterFamily,
        endpoints: &[Endpoint],
        directory: &dyn AdapterDirectory,
        factory: &dyn ProviderFactory,
    ) -> KmsResult<()> {
        self.unbind();

        let provider = match SelectionStrategy::for_family(family) {
            SelectionStrategy::CrossChecked => {
                Self::bind_cross_checked(family, endpoints, directory, factory)?
            }
            SelectionStrategy::FirstAvailable => {
                Self::bind_first_available(family, endpoints, directory, factory)?
            }
        };

        log::debug!(
            "Bound {} provider ({}) to APQN {}",
            family,
            provider.name(),
            provider.endpoint()
        );
        self.provider = Some(provider);
        Ok(())
    }

    fn bind_cross_checked(
        family: AdapterFamily,
        endpoints: &[Endpoint],
        directory: &dyn AdapterDirectory,
        factory: &dyn ProviderFactory,
    ) -> KmsResult<Box<dyn CryptoProvider>> {
        cross_check_master_keys(directory, endpoints)?;

        let mut sorted = endpoints.to_vec();
        sorted.sort();

        let endpoint = sorted
            .into_iter()
            .find(|e| directory.is_online(*e, family))
            .ok_or_else(|| KmsError::no_available_endpoint(&format_endpoints(endpoints)))?;

        factory.open(family, endpoint)
    }

    fn bind_first_available(
        family: AdapterFamily,
        endpoints: &[Endpoint],
        directory: &dyn AdapterDirectory,
        factory: &dyn ProviderFactory,
    ) -> KmsResult<Box<dyn CryptoProvider>> {
        for endpoint in endpoints {
            if !directory.is_online(*endpoint, family) {
                log::debug!("APQN {} is not online, skipping it", endpoint);
                continue;
            }

            match factory.open(family, *endpoint) {
                Ok(provider) => return Ok(provider),
                Err(e) => log::debug!("APQN {} could not be opened: {}", endpoint, e),
            }
        }

        Err(KmsError::no_available_endpoint(&format_endpoints(endpoints)))
    }

    /// Release the bound provider; a no-op when unbound
    pub fn unbind(&mut self) {
        if let Some(mut provider) = self.provider.take() {
            let endpoint = provider.endpoint();
            if let Err(e) = provider.close() {
                log::warn!("Failed to close provider for APQN {}: {}", endpoint, e);
            }
            log::debug!("Unbound provider from APQN {}", endpoint);
        }
    }

    /// The bound provider
    pub fn provider(&mut self) -> KmsResult<&mut (dyn CryptoProvider + 'static)> {
        match self.provider.as_deref_mut() {
            Some(provider) => Ok(provider),
            None => Err(KmsError::incomplete("a bound crypto provider")),
        }
    }

    /// Signer for the key in `blob`
    pub fn signer<'a>(&'a mut self, blob: &'a KeyBlob) -> KmsResult<IdentitySigner<'a>> {
        let provider = self.provider()?;
        Ok(IdentitySigner { provider, blob })
    }
}

impl Drop for ProviderBinding {
    fn drop(&mut self) {
        self.unbind();
    }
}

/// The identity key of one blob, usable for signing certificates
pub struct IdentitySigner<'a> {
    provider: &'a mut dyn CryptoProvider,
    blob: &'a KeyBlob,
}

impl IdentitySigner<'_> {
    pub fn public_key(&mut self, rsa_pss: bool) -> KmsResult<SubjectPublicKeyInfoOwned> {
        self.provider.public_key(self.blob, rsa_pss)
    }

    pub fn sign(&mut self, scheme: &SignatureScheme, message: &[u8]) -> KmsResult<Vec<u8>> {
        self.provider.sign(self.blob, scheme, message)
    }
}
