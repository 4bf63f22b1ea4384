fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .bytes([".transfer.SnapshotRecord.payload"])
        .compile_protos(&["proto/transfer.proto"], &["proto"])?;
    println!("cargo:rerun-if-changed=proto/transfer.proto");
    Ok(())
}
