//! Per-target-version memory layout of the interpreter objects the Stack
//! Reconstructor decodes.
//!
//! Zeek's `Location` class has changed field order and size across releases;
//! the rest of the layout (`CallInfo`, `Func`, frame slots) has not, so far.
//! Rather than generate a struct per version, we keep one value type and
//! look up the whole set of byte offsets at runtime from the target's
//! reported version string — new releases are added here as table entries,
//! not new code paths.

use crate::core::types::IntrospectionError;

/// Byte layout of the structures the Stack Reconstructor walks, for one
/// target version family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutDescriptor {
    /// Size in bytes of one `CallInfo` element in the call-info vector.
    pub call_info_size: usize,
    /// Offset of the call-expression pointer within a `CallInfo` element.
    pub call_info_call_offset: usize,
    /// Offset of the function pointer within a `CallInfo` element.
    pub call_info_func_offset: usize,
    /// Size in bytes of one element in the frame-pointer vector.
    pub frame_ptr_size: usize,
    /// Offset of the `next_statement` pointer within a frame.
    pub frame_next_stmt_offset: usize,
    /// Size in bytes of a `Func` object.
    pub func_object_size: usize,
    /// Offset of the kind discriminator (0 = script, nonzero = builtin)
    /// within a `Func` object.
    pub func_kind_offset: usize,
    /// Offset of the name string pointer within a `Func` object.
    pub func_name_offset: usize,
    /// Offset of the `Location*` within a `Func` object.
    pub func_location_offset: usize,
    /// Offset of the `Location*` within an interpreter ("BroObj") object,
    /// just behind its vtable pointer.
    pub interp_object_location_offset: usize,
    /// Size in bytes of a `Location` object.
    pub location_size: usize,
    /// Offset of the filename pointer within a `Location` object.
    pub location_filename: usize,
    /// Offset of the first-line field within a `Location` object.
    pub location_first_line: usize,
    /// Offset of the last-line field within a `Location` object.
    pub location_last_line: usize,
}

/// `(version_prefix, layout)` pairs, longest prefix wins. Only the
/// `Location` fields have ever changed between registered versions; the
/// rest are carried identically because no release has moved them.
const OFFSET_TABLE: &[(&str, LayoutDescriptor)] = &[
    (
        "3.0",
        LayoutDescriptor {
            call_info_size: 24,
            call_info_call_offset: 0,
            call_info_func_offset: 8,
            frame_ptr_size: 8,
            frame_next_stmt_offset: 144,
            func_object_size: 96,
            func_kind_offset: 56,
            func_name_offset: 72,
            func_location_offset: 8,
            interp_object_location_offset: 8,
            location_size: 24,
            location_filename: 8,
            location_first_line: 16,
            location_last_line: 20,
        },
    ),
    (
        "3.1",
        LayoutDescriptor {
            call_info_size: 24,
            call_info_call_offset: 0,
            call_info_func_offset: 8,
            frame_ptr_size: 8,
            frame_next_stmt_offset: 144,
            func_object_size: 96,
            func_kind_offset: 56,
            func_name_offset: 72,
            func_location_offset: 8,
            interp_object_location_offset: 8,
            location_size: 16,
            location_filename: 0,
            location_first_line: 8,
            location_last_line: 12,
        },
    ),
];

/// Finds the layout whose registered version prefix is the longest match
/// for `version`. E.g. `"3.1.0-rc1"` matches `"3.1"`, not a hypothetical
/// shorter `"3"` entry. No matching prefix is an `UnknownTargetVersion`
/// error — the sampling loop never runs against a guessed layout.
pub fn lookup(version: &str) -> Result<LayoutDescriptor, IntrospectionError> {
    OFFSET_TABLE
        .iter()
        .filter(|(prefix, _)| version.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, layout)| *layout)
        .ok_or_else(|| IntrospectionError::UnknownTargetVersion(version.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_entry_for_unknown_major_version() {
        assert!(lookup("1.0").is_err());
    }

    #[test]
    fn longest_prefix_wins() {
        let cases = [("3.0.2", "3.0"), ("3.1.0", "3.1"), ("3.1.0-rc1", "3.1")];
        for (version, expected_prefix) in cases {
            let (_, expected) =
                OFFSET_TABLE.iter().find(|(prefix, _)| *prefix == expected_prefix).unwrap();
            assert_eq!(lookup(version).unwrap(), *expected, "version {version}");
        }
    }

    #[test]
    fn exact_3_0_location_values() {
        let layout = lookup("3.0.1").unwrap();
        assert_eq!(layout.location_size, 24);
        assert_eq!(layout.location_filename, 8);
        assert_eq!(layout.location_first_line, 16);
        assert_eq!(layout.location_last_line, 20);
    }

    #[test]
    fn exact_3_1_location_values() {
        let layout = lookup("3.1.2").unwrap();
        assert_eq!(layout.location_size, 16);
        assert_eq!(layout.location_filename, 0);
        assert_eq!(layout.location_first_line, 8);
        assert_eq!(layout.location_last_line, 12);
    }

    #[test]
    fn non_location_fields_are_stable_across_versions() {
        let v30 = lookup("3.0.0").unwrap();
        let v31 = lookup("3.1.0").unwrap();
        assert_eq!(v30.call_info_size, v31.call_info_size);
        assert_eq!(v30.func_object_size, v31.func_object_size);
        assert_eq!(v30.frame_next_stmt_offset, v31.frame_next_stmt_offset);
    }
}
