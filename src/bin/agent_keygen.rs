use base64::{engine::general_purpose, Engine as _};
use clap::Parser;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde_json::json;
use sha2::{Digest, Sha256};

#[derive(Parser)]
#[command(name = "agent-keygen")]
#[command(about = "Generate an Ed25519 agent signing key and its registry record")]
struct Args {
    /// Key id to register; defaults to the RFC 7638 JWK thumbprint of the public key.
    #[arg(short, long)]
    key_id: Option<String>,
}

/// RFC 7638 thumbprint of an Ed25519 OKP JWK.
fn jwk_thumbprint(public_key: &[u8; 32]) -> String {
    let x = general_purpose::URL_SAFE_NO_PAD.encode(public_key);
    // Members in lexicographic order, no whitespace.
    let canonical = format!(r#"{{"crv":"Ed25519","kty":"OKP","x":"{}"}}"#, x);
    general_purpose::URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let signing_key = SigningKey::generate(&mut OsRng);
    let public_key = signing_key.verifying_key().to_bytes();
    let key_id = args.key_id.unwrap_or_else(|| jwk_thumbprint(&public_key));

    let output = json!({
        "key_id": key_id,
        "public_key": general_purpose::STANDARD.encode(public_key),
        "private_key": general_purpose::STANDARD.encode(signing_key.to_bytes()),
        "registry_record": {
            "key_id": key_id,
            "public_key": general_purpose::STANDARD.encode(public_key),
            "registration_status": "active",
        },
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thumbprint_is_stable_and_url_safe() {
        let key = SigningKey::from_bytes(&[7u8; 32]).verifying_key().to_bytes();
        let first = jwk_thumbprint(&key);
        assert_eq!(first, jwk_thumbprint(&key));
        assert_eq!(first.len(), 43);
        assert!(!first.contains('+') && !first.contains('/') && !first.contains('='));
    }
}
