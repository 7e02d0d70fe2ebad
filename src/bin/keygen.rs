use beckn_p2p::keys::{KeyId, KeyPair};
use clap::Parser;

#[derive(Parser)]
#[command(name = "keygen")]
#[command(about = "Generate an Ed25519 signing identity for a protocol node")]
struct Args {
    #[arg(short, long)]
    subscriber_id: String,

    #[arg(short, long, default_value = "key-1")]
    unique_key_id: String,

    /// Re-derive the public key from an existing base64 seed instead of generating one
    #[arg(long, env = "BECKN_SIGNING_SEED")]
    seed: Option<String>,

    /// Print as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let key_id = KeyId::new(args.subscriber_id, args.unique_key_id);
    let key_pair = match args.seed.as_deref() {
        Some(seed) => KeyPair::from_base64_seed(key_id, seed)?,
        None => KeyPair::generate(key_id),
    };

    if args.json {
        let output = serde_json::json!({
            "key_id": key_pair.key_id().to_string(),
            "signing_public_key": key_pair.public_key_base64(),
            "signing_seed": key_pair.seed_base64(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("key_id             = {}", key_pair.key_id());
        println!("signing_public_key = {}", key_pair.public_key_base64());
        println!("signing_seed       = {}", key_pair.seed_base64());
        println!();
        println!("Keep the seed secret; set it as BECKN_SIGNING_SEED for the node.");
    }

    Ok(())
}
