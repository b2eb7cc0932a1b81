/// Builds a 256-entry byte-class lookup table from byte-string slices.
macro_rules! b_map {
    ($name:ident => $( $slice:expr ),+) => {
        pub(crate) static $name: [bool; 256] = {
            let mut table = [false; 256];
            $(
                let bytes: &[u8] = $slice;
                let mut i = 0;
                while i < bytes.len() {
                    table[bytes[i] as usize] = true;
                    i += 1;
                }
            )+
            table
        };
    };
}

pub(crate) use b_map;
