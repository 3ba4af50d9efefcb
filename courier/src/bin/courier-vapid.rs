//! Generate a VAPID key pair for the push channel.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use p256::ecdsa::SigningKey;
use p256::elliptic_curve::rand_core::OsRng;

fn main() -> anyhow::Result<()> {
    let mut as_json = false;
    let mut subject = String::from("mailto:ops@localhost");
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_usage();
                return Ok(());
            }
            "--json" => as_json = true,
            "--subject" => {
                subject = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--subject needs a value"))?;
            }
            other => anyhow::bail!("unknown argument '{other}' (try --help)"),
        }
    }

    let signing_key = SigningKey::random(&mut OsRng);
    let public_key = URL_SAFE_NO_PAD.encode(
        signing_key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes(),
    );
    let private_key = URL_SAFE_NO_PAD.encode(signing_key.to_bytes());

    if as_json {
        let out = serde_json::json!({
            "public_key": public_key,
            "private_key": private_key,
            "subject": subject,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("COURIER_VAPID_PUBLIC_KEY={public_key}");
        println!("COURIER_VAPID_PRIVATE_KEY={private_key}");
        println!("COURIER_VAPID_SUBJECT={subject}");
    }
    Ok(())
}

fn print_usage() {
    println!("courier-vapid: generate VAPID keys for Web Push");
    println!();
    println!("Usage:");
    println!("  courier-vapid [--subject mailto:you@example.com]   # .env lines");
    println!("  courier-vapid --json                               # JSON object");
    println!();
    println!("Hand the public key to browsers as the applicationServerKey.");
}
