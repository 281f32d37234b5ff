#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(rows) = dq_io::read_csv_str(input) {
        let _ = dq_io::write_csv_string(&rows);
    }
});
