//! Compiles the wire protocol into native Rust types.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=protos/gpupgrade.proto");

    tonic_build::configure().compile(&["protos/gpupgrade.proto"], &["protos"])?;

    Ok(())
}
