pub(crate) mod hex_option;
pub(crate) mod hex_u_int;
