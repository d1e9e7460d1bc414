use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let descriptor_path = PathBuf::from(env::var("OUT_DIR")?).join("snapshots_descriptor.bin");

    tonic_build::configure()
        .build_server(true)
        .build_client(true) // Useful for testing
        .file_descriptor_set_path(&descriptor_path)
        // Use pbjson's well-known types so every message has a protobuf JSON mapping.
        .compile_well_known_types(true)
        .extern_path(".google.protobuf", "::pbjson_types")
        .compile_protos(&["proto/snapshots.proto"], &["proto/"])?;

    let descriptor_set = std::fs::read(&descriptor_path)?;
    pbjson_build::Builder::new()
        .register_descriptors(&descriptor_set)?
        .build(&[".containerd.services.snapshots.v1"])?;

    println!("cargo:rerun-if-changed=proto/snapshots.proto");
    Ok(())
}
