fn main() -> Result<(), Box<dyn std::error::Error>> {
    let vendored = "proto/streambus.proto";
    println!("cargo:rerun-if-changed={vendored}");
    tonic_build::compile_protos(vendored)?;
    Ok(())
}
