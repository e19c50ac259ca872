//! Per-parameter load cycle.
//!
//! Each `load` runs read → classify → optional forced clear → prompt loop →
//! migrate-write → return. Nothing survives between calls except the backend
//! contents and the key cached in the `KeyDeriver`.

use thiserror::Error;

use crate::crypto::codec::MAX_PLAINTEXT_LEN;
use crate::crypto::key::{KeyDeriver, KeyError};
use crate::format::{self, Decoded, FormatError, SourceKind};
use crate::params::{validate_table, ConfigParam, ParamError, ParamGroup};
use crate::prompt::{PromptError, Prompter};
use crate::storage::{Backend, StorageError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("device key unavailable: {0}")]
    Key(#[from] KeyError),
    #[error("storage failed: {0}")]
    Storage(#[from] StorageError),
    #[error("could not encode value: {0}")]
    Format(#[from] FormatError),
    #[error("parameter table invalid: {0}")]
    Params(#[from] ParamError),
    #[error("a value for {key} is required but operator input is unavailable: {source}")]
    PromptUnavailable {
        key: &'static str,
        #[source]
        source: PromptError,
    },
}

/// Configuration context: one backend, one operator channel, one device key.
pub struct ParamStore<B, P> {
    backend: B,
    prompter: P,
    keys: KeyDeriver,
}

impl<B: Backend, P: Prompter> ParamStore<B, P> {
    pub fn new(backend: B, prompter: P, keys: KeyDeriver) -> Self {
        Self {
            backend,
            prompter,
            keys,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn prompter(&self) -> &P {
        &self.prompter
    }

    pub fn prompter_mut(&mut self) -> &mut P {
        &mut self.prompter
    }

    pub fn keys(&self) -> &KeyDeriver {
        &self.keys
    }

    pub fn into_parts(self) -> (B, P, KeyDeriver) {
        (self.backend, self.prompter, self.keys)
    }

    /// Validates descriptor keys against this backend's limits.
    pub fn validate(&self, groups: &[ParamGroup]) -> Result<(), StoreError> {
        validate_table(groups, self.backend.max_key_len())?;
        Ok(())
    }

    /// Runs `f` with `namespace` open and closes it afterwards, also on error.
    pub fn with_namespace<T>(
        &mut self,
        namespace: &str,
        f: impl FnOnce(&mut Self) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.backend.open(namespace)?;
        let result = f(self);
        let closed = self.backend.close();
        let value = result?;
        closed?;
        Ok(value)
    }

    /// Reads and decodes an entry without prompting or writing.
    pub fn peek(&self, param: &ConfigParam) -> Result<Decoded, StoreError> {
        let raw = self.backend.get(param.key)?;
        Ok(format::decode(raw.as_deref(), &self.keys)?)
    }

    /// Resolves one parameter from the open namespace.
    ///
    /// `default` is used when nothing is stored. With `force`, a configurable
    /// parameter is re-prompted and its stored value becomes the default.
    pub fn load(
        &mut self,
        param: &ConfigParam,
        default: &str,
        force: bool,
    ) -> Result<String, StoreError> {
        let raw = self.backend.get(param.key)?;
        let decoded = format::decode(raw.as_deref(), &self.keys)?;

        if let Some(failure) = decoded.failure {
            tracing::warn!(
                op = "param.decrypt",
                key = param.key,
                error = %failure,
                "Stored secret unreadable, re-provisioning required"
            );
        }

        let mut migrate = format::needs_migration(decoded.kind, param.secret);
        let mut default = default.to_string();
        if !fits(param, &default) {
            warn_too_long(param, "default");
            default.clear();
        }
        let mut value = if decoded.kind == SourceKind::Absent {
            default.clone()
        } else {
            decoded.value
        };
        if !fits(param, &value) {
            warn_too_long(param, "stored");
            value.clear();
        }

        if force && param.configurable {
            default = std::mem::take(&mut value);
        }

        if value.is_empty() {
            loop {
                let answer = match self.prompter.prompt_line(param.prompt, &default) {
                    Ok(answer) => answer,
                    Err(PromptError::Closed) if !param.mandatory => {
                        tracing::debug!(
                            op = "param.prompt",
                            key = param.key,
                            "No operator present, keeping default for optional value"
                        );
                        default.clone()
                    }
                    Err(source) => {
                        return Err(StoreError::PromptUnavailable {
                            key: param.key,
                            source,
                        })
                    }
                };
                if !fits(param, &answer) {
                    warn_too_long(param, "entered");
                    continue;
                }
                if answer.is_empty() && param.mandatory {
                    tracing::warn!(
                        op = "param.prompt",
                        key = param.key,
                        "A value is required for this key to proceed"
                    );
                    continue;
                }
                value = answer;
                migrate = true;
                break;
            }
        }

        let mut written = false;
        if migrate {
            let encoded = format::encode(&value, param.secret, &self.keys)?;
            if raw.as_deref() != Some(encoded.as_str()) {
                written = self.backend.put(param.key, &encoded)?;
            }
        }

        tracing::info!(
            op = "param.load",
            key = param.key,
            source = decoded.kind.as_str(),
            migrated = migrate,
            written,
            "Parameter resolved"
        );

        Ok(value)
    }
}

/// Whether `value` can be written in the canonical form of `param`.
fn fits(param: &ConfigParam, value: &str) -> bool {
    !param.secret || value.len() <= MAX_PLAINTEXT_LEN
}

fn warn_too_long(param: &ConfigParam, origin: &'static str) {
    tracing::warn!(
        op = "param.load",
        key = param.key,
        origin,
        max = MAX_PLAINTEXT_LEN,
        "Value too long to encrypt, discarding it"
    );
}
