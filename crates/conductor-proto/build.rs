#![expect(unsafe_code)]

use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // tonic-build shells out to protoc; point it at the vendored binary so
    // builds do not depend on a system install.
    let protoc = protoc_bin_vendored::protoc_bin_path()?;
    // SAFETY: build scripts are single-threaded at this point.
    unsafe { std::env::set_var("PROTOC", &protoc) };

    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR")?;
    let manifest_path = PathBuf::from(manifest_dir);

    // Navigate to the proto directory from the crate root
    let proto_dir = manifest_path
        .parent() // crates/
        .and_then(|p| p.parent()) // workspace root
        .map(|p| p.join("proto"))
        .ok_or("failed to locate workspace proto directory")?;

    println!("cargo:rerun-if-changed={}", proto_dir.display());

    let channel_proto = proto_dir.join("conductor/channel/v1/channel.proto");

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .type_attribute(".", "#[allow(clippy::large_enum_variant)]")
        .compile_protos(
            &[channel_proto
                .to_str()
                .ok_or("non-utf8 path to channel.proto")?],
            &[proto_dir.to_str().ok_or("non-utf8 proto directory path")?],
        )?;
    Ok(())
}
