fn main() -> Result<(), Box<dyn std::error::Error>> {
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    tonic_build::compile_protos("proto/kv.proto")?;
    tonic_build::compile_protos("proto/raft.proto")?;
    Ok(())
}
