fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use the vendored protoc unless the environment provides one.
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }
    let well_known = protoc_bin_vendored::include_path()?;

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &["proto/mesh.proto", "proto/registry.proto"],
            &[std::path::PathBuf::from("proto"), well_known],
        )?;

    println!("cargo:rerun-if-changed=proto/mesh.proto");
    println!("cargo:rerun-if-changed=proto/registry.proto");

    Ok(())
}
