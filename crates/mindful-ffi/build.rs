fn main() {
    uniffi::generate_scaffolding("src/mindful.udl").expect("failed to generate UniFFI scaffolding");
    configure_android();
}

// Keep the Java_org_webrtc_* JNI symbols in the .so so webrtc::InitAndroid()
// can call back into the bundled Java classes.
#[cfg(feature = "livekit")]
fn configure_android() {
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("android") {
        webrtc_sys_build::configure_jni_symbols().expect("failed to configure JNI symbols for Android");
    }
}

#[cfg(not(feature = "livekit"))]
fn configure_android() {}
