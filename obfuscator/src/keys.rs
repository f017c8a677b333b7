use rand::Rng;

/// Draws a fresh 16-bit key from the thread's entropy source.
pub fn generate_key() -> u16 {
    rand::thread_rng().gen()
}

/// Masks a virtual instruction pointer with `key` and packs the key into the
/// low half so the interpreter can undo the mask:
/// high 16 bits = `vip ^ (k1 << 8) ^ k2`, low 16 bits = the key itself.
pub fn encode_vip_entry(vip: u32, key: u16) -> u32 {
    let k1 = key as u8;
    let k2 = (key >> 8) as u8;

    let enc = vip ^ (u32::from(k1) << 8) ^ u32::from(k2);

    (enc << 16) | u32::from(key)
}
