fn main() -> anyhow::Result<()> {
    let protoc = protoc_bin_vendored::protoc_bin_path()?;
    // SAFETY: the build script is single-threaded here.
    unsafe {
        std::env::set_var("PROTOC", protoc);
    }
    tonic_build::compile_protos("proto/llm_service.proto")?;
    Ok(())
}
