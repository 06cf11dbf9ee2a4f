use std::io::Result;

fn main() -> Result<()> {
    tonic_build::configure()
        .build_client(false)
        .compile_protos(&["proto/deskctl.proto"], &["proto/"])?;
    Ok(())
}
