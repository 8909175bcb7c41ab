//! Identity command - loads a certificate/key pair the way a provisioning
//! run would and prints what was found.

use crate::cli::args::IdentityArgs;
use crate::identity::Identity;
use anyhow::{Context, Result};

pub fn run_identity(args: IdentityArgs) -> Result<()> {
    let identity = Identity::load(&args.dir, &args.cert, &args.key).with_context(|| {
        format!(
            "load identity {} / {} from {}",
            args.cert,
            args.key,
            args.dir.display()
        )
    })?;
    println!("subject:      {}", identity.subject());
    println!("key encoding: {}", identity.encoding());
    println!("chain length: {}", identity.chain().len());
    println!("sha256:       {}", identity.fingerprint());
    Ok(())
}
