//! Prints the CredentialIssuer CustomResourceDefinition as YAML.
//!
//! ```sh
//! cargo run --bin crdgen > config/crd/credentialissuer.yaml
//! ```

use kube::CustomResourceExt;
use trust_controller::crd::CredentialIssuer;

fn main() -> anyhow::Result<()> {
    let yaml = serde_yaml::to_string(&CredentialIssuer::crd())?;
    print!("{yaml}");
    Ok(())
}
