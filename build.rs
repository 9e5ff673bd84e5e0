fn main() -> Result<(), std::io::Error> {
    if std::env::var_os("PROTOC").is_none() {
        if let Ok(path) = protoc_bin_vendored::protoc_bin_path() {
            std::env::set_var("PROTOC", path);
        }
    }
    let protos = &[concat!(env!("CARGO_MANIFEST_DIR"), "/proto/host.proto")];
    let includes = &[concat!(env!("CARGO_MANIFEST_DIR"), "/proto")];
    prost_build::compile_protos(protos, includes)?;
    Ok(())
}
