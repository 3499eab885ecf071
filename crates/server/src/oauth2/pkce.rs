//! Proof Key for Code Exchange (RFC 7636).

use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use subtle::ConstantTimeEq;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeChallengeMethod {
    #[serde(rename = "plain")]
    Plain,
    S256,
}

impl CodeChallengeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodeChallengeMethod::Plain => "plain",
            CodeChallengeMethod::S256 => "S256",
        }
    }

    /// Derive the challenge a verifier corresponds to under this method.
    pub fn challenge_for(&self, verifier: &str) -> String {
        match self {
            CodeChallengeMethod::Plain => verifier.to_string(),
            CodeChallengeMethod::S256 => {
                let hash = Sha256::digest(verifier.as_bytes());
                base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hash)
            }
        }
    }
}

impl fmt::Display for CodeChallengeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodeChallengeMethod {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(CodeChallengeMethod::Plain),
            "S256" => Ok(CodeChallengeMethod::S256),
            other => Err(format!("Unsupported code_challenge_method: {other}")),
        }
    }
}

/// Recompute the challenge from `verifier` and compare it with the stored one
/// in constant time.
pub fn verify(challenge: &str, method: CodeChallengeMethod, verifier: &str) -> bool {
    let computed = method.challenge_for(verifier);
    computed.as_bytes().ct_eq(challenge.as_bytes()).into()
}
