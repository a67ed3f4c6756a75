use bincode::config::{Configuration, Fixint, LittleEndian, NoLimit};

// Use legacy encoding for fixed-width integers (event records have a constant size)
pub const BINCODE_CONFIG: Configuration<LittleEndian, Fixint, NoLimit> = bincode::config::legacy();

/// Archives are only read from and written to paths ending in this suffix.
pub const FILE_SUFFIX: &str = ".placed.mla";

pub const META_FILE: &str = "meta";
pub const USERS_FILE: &str = "users";

pub fn chunk_file_name(id: u32) -> String {
    format!("chunks/{}", id)
}
