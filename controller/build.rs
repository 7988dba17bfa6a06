fn main() {
    // Only the device build needs the ESP-IDF environment propagated.
    if std::env::var("CARGO_FEATURE_ESP32").is_ok() {
        embuild::espidf::sysenv::output();
    }
}
