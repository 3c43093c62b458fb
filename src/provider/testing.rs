//! Software provider wrapper that records key lifecycle calls.

use std::cell::RefCell;
use std::rc::Rc;

use spki::SubjectPublicKeyInfoOwned;

use super::{CryptoProvider, KeyBlob, ProviderFactory, SignatureScheme, SoftwareProviderFactory};
use crate::adapter::{AdapterFamily, Endpoint};
use crate::error::{error_codes, KmsError, KmsResult};
use crate::identity::KeySpec;

/// Blobs handed out and destroyed, shared by all providers of one factory
#[derive(Debug, Default)]
pub struct KeyLedger {
    pub generated: Vec<KeyBlob>,
    pub destroyed: Vec<KeyBlob>,
}

type GenerateHook = Rc<dyn Fn()>;

#[derive(Clone, Default)]
pub struct TrackingFactory {
    pub ledger: Rc<RefCell<KeyLedger>>,
    fail_generation: Rc<RefCell<bool>>,
    on_generate: Option<GenerateHook>,
}

impl TrackingFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `hook` after each key is generated, before the blob is returned
    pub fn with_hook<H: Fn() + 'static>(mut self, hook: H) -> Self {
        self.on_generate = Some(Rc::new(hook));
        self
    }

    pub fn fail_generation(&self, fail: bool) {
        *self.fail_generation.borrow_mut() = fail;
    }
}

impl ProviderFactory for TrackingFactory {
    fn open(&self, family: AdapterFamily, endpoint: Endpoint) -> KmsResult<Box<dyn CryptoProvider>> {
        Ok(Box::new(TrackingProvider {
            inner: SoftwareProviderFactory::new().open(family, endpoint)?,
            factory: self.clone(),
        }))
    }
}

struct TrackingProvider {
    inner: Box<dyn CryptoProvider>,
    factory: TrackingFactory,
}

impl CryptoProvider for TrackingProvider {
    fn family(&self) -> AdapterFamily {
        self.inner.family()
    }

    fn endpoint(&self) -> Endpoint {
        self.inner.endpoint()
    }

    fn name(&self) -> &'static str {
        "tracking"
    }

    fn generate_key(&mut self, spec: &KeySpec) -> KmsResult<KeyBlob> {
        if *self.factory.fail_generation.borrow() {
            return Err(KmsError::provider_error(
                "generate key",
                "token full",
                error_codes::PROVIDER_KEY_GENERATION_FAILED,
            ));
        }
        let blob = self.inner.generate_key(spec)?;
        self.factory.ledger.borrow_mut().generated.push(blob.clone());
        if let Some(hook) = &self.factory.on_generate {
            hook();
        }
        Ok(blob)
    }

    fn public_key(&mut self, blob: &KeyBlob, rsa_pss: bool) -> KmsResult<SubjectPublicKeyInfoOwned> {
        self.inner.public_key(blob, rsa_pss)
    }

    fn sign(&mut self, blob: &KeyBlob, scheme: &SignatureScheme, message: &[u8]) -> KmsResult<Vec<u8>> {
        self.inner.sign(blob, scheme, message)
    }

    fn destroy_key(&mut self, blob: &KeyBlob) -> KmsResult<()> {
        self.factory.ledger.borrow_mut().destroyed.push(blob.clone());
        self.inner.destroy_key(blob)
    }

    fn close(&mut self) -> KmsResult<()> {
        self.inner.close()
    }
}
