//! Reconstructing a script-level call stack from the target's `call_stack`
//! (a `std::vector<CallInfo>`) and, for top-of-stack refinement, its
//! `g_frame_stack`.
//!
//! This is the GCC/x86_64-specific part of the profiler: it knows the byte
//! layout of `std::vector`, of the interpreter's `CallInfo`/`Func`/`BroObj`
//! objects, and defers every offset that varies across Zeek releases
//! (`Location`, and in principle everything else) to the `LayoutDescriptor`.

use crate::core::image::ZeekImage;
use crate::core::memory::MemorySource;
use crate::core::offsets::LayoutDescriptor;
use crate::core::types::{
    empty_call_stack_entry, CallEntry, FunctionDescriptor, FunctionKind, IntrospectionError,
    SourceLocation,
};

/// Reconstructs the current call stack of a stopped Zeek process.
pub struct StackReconstructor<'a> {
    mem: &'a dyn MemorySource,
    image: &'a ZeekImage,
    layout: LayoutDescriptor,
}

impl<'a> StackReconstructor<'a> {
    pub fn new(mem: &'a dyn MemorySource, image: &'a ZeekImage, layout: LayoutDescriptor) -> Self {
        StackReconstructor { mem, image, layout }
    }

    /// Returns `(frames, empty_flag)`. Frames are root-first (index 0 is the
    /// outermost call, the last entry is the leaf) — callers that need
    /// leaf-first order (pprof's convention) reverse this themselves at
    /// serialization time.
    pub fn sample(&self) -> Result<(Vec<CallEntry>, bool), IntrospectionError> {
        let (start, finish, data) = self.read_std_vector(self.image.call_stack_addr)?;
        let stride = self.layout.call_info_size;
        let call_stack_len = ((finish - start) as usize) / stride;

        if call_stack_len == 0 {
            return Ok((vec![empty_call_stack_entry()], true));
        }

        let mut result: Vec<CallEntry> = Vec::with_capacity(call_stack_len);
        for i in 0..call_stack_len {
            let offset = i * stride;
            let call_ptr = u64::from_le_bytes(
                data[offset + self.layout.call_info_call_offset..offset + self.layout.call_info_call_offset + 8]
                    .try_into()
                    .unwrap(),
            );
            let func_ptr = u64::from_le_bytes(
                data[offset + self.layout.call_info_func_offset..offset + self.layout.call_info_func_offset + 8]
                    .try_into()
                    .unwrap(),
            );

            // A non-null call pointer on this CallInfo entry names the call
            // site of the *caller* frame (i - 1), not of this one.
            if call_ptr != 0 && i > 0 {
                let (filename, line) = self.read_location_from_interp_object(call_ptr)?;
                result[i - 1].call_site_filename = filename;
                result[i - 1].call_site_line = line;
            }

            let function = self.read_function(func_ptr)?;
            result.push(CallEntry {
                function,
                call_site_filename: String::new(),
                call_site_line: 0,
            });
        }

        self.refine_leaf(&mut result, call_stack_len)?;
        self.reconcile_leaf(&mut result);

        Ok((result, false))
    }

    fn read_function(&self, func_ptr: u64) -> Result<FunctionDescriptor, IntrospectionError> {
        let func_data = self.mem.peek(func_ptr, self.layout.func_object_size)?;

        let kind_offset = self.layout.func_kind_offset;
        let kind_value = u64::from_le_bytes(func_data[kind_offset..kind_offset + 8].try_into().unwrap());
        let kind = if kind_value == 0 { FunctionKind::Script } else { FunctionKind::Builtin };

        let name_offset = self.layout.func_name_offset;
        let name_ptr = u64::from_le_bytes(func_data[name_offset..name_offset + 8].try_into().unwrap());
        let name = self.mem.read_cstring(name_ptr)?;

        let loc_offset = self.layout.func_location_offset;
        let loc_ptr = u64::from_le_bytes(func_data[loc_offset..loc_offset + 8].try_into().unwrap());
        let location = self.read_location_full(loc_ptr)?;

        Ok(FunctionDescriptor { address: func_ptr, name, kind, location })
    }

    /// Reads `next_statement` from the frame that corresponds to the
    /// innermost call entry and, if present, attributes its location as
    /// that entry's call site. Mismatched frame/call sizes are logged, not
    /// fatal, unless the leaf happens to be a builtin — which would mask a
    /// real bug rather than the expected case of a script calling into one.
    fn refine_leaf(&self, result: &mut [CallEntry], call_stack_len: usize) -> Result<(), IntrospectionError> {
        let (_start, finish, frame_data) = self.read_std_vector(self.image.frame_stack_addr)?;
        let stride = self.layout.frame_ptr_size;
        let _ = finish;
        let frame_stack_len = frame_data.len() / stride;

        if frame_stack_len < call_stack_len {
            let leaf_is_builtin =
                matches!(result.last().map(|e| e.function.kind), Some(FunctionKind::Builtin));
            if !leaf_is_builtin {
                log::warn!(
                    "frame_stack has {} entries but call_stack has {}",
                    frame_stack_len,
                    call_stack_len
                );
            }
            return Ok(());
        }

        let frame_offset = (call_stack_len - 1) * stride;
        let frame_ptr =
            u64::from_le_bytes(frame_data[frame_offset..frame_offset + 8].try_into().unwrap());
        let next_stmt_ptr = self.mem.read_ptr(frame_ptr + self.layout.frame_next_stmt_offset as u64)?;
        if next_stmt_ptr != 0 {
            let (filename, line) = self.read_location_from_interp_object(next_stmt_ptr)?;
            let leaf = result.last_mut().expect("call_stack_len > 0");
            leaf.call_site_filename = filename;
            leaf.call_site_line = line;
        }
        Ok(())
    }

    /// If the leaf's own declared location disagrees with where it was
    /// actually invoked from (a `.bif`-backed builtin dispatching into a
    /// script event handler), prepend a synthetic entry carrying the
    /// builtin's original identity and rewrite the leaf's function-home to
    /// the observed call site so the two frames intern to distinct
    /// functions instead of collapsing into one.
    fn reconcile_leaf(&self, result: &mut Vec<CallEntry>) {
        let leaf_idx = result.len() - 1;
        let call_site_filename = result[leaf_idx].call_site_filename.clone();
        let home_filename = result[leaf_idx].function.location.filename.clone();
        if call_site_filename.is_empty() || call_site_filename == home_filename {
            return;
        }
        let mut synthetic = result[leaf_idx].clone();
        synthetic.call_site_filename.clear();
        synthetic.call_site_line = 0;
        result.insert(leaf_idx, synthetic);
        let leaf = &mut result[leaf_idx + 1];
        leaf.function.location.filename = call_site_filename;
        leaf.function.location.first_line = 0;
        leaf.function.location.last_line = 0;
    }

    /// Reads `{start, finish}` from a `std::vector<T>` header and the bytes
    /// in between. `end_of_storage` (the third word) is ignored — only the
    /// live range matters here.
    fn read_std_vector(&self, addr: u64) -> Result<(u64, u64, Vec<u8>), IntrospectionError> {
        let header = self.mem.peek(addr, 16)?;
        let start = u64::from_le_bytes(header[0..8].try_into().unwrap());
        let finish = u64::from_le_bytes(header[8..16].try_into().unwrap());
        if finish < start {
            return Err(IntrospectionError::ImageResolutionFailed(
                0,
                format!("vector at {:#x} has finish < start ({:#x} < {:#x})", addr, finish, start),
            ));
        }
        let data = self.mem.peek(start, (finish - start) as usize)?;
        Ok((start, finish, data))
    }

    /// Every interpreter object ("BroObj") has its `Location*` just behind
    /// its vtable pointer, at `interp_object_location_offset`.
    fn read_location_from_interp_object(&self, addr: u64) -> Result<(String, i64), IntrospectionError> {
        let offset = self.layout.interp_object_location_offset;
        let header = self.mem.peek(addr, offset + 8)?;
        let loc_ptr = u64::from_le_bytes(header[offset..offset + 8].try_into().unwrap());
        let full = self.read_location_full(loc_ptr)?;
        Ok((full.filename, full.first_line))
    }

    /// Reads the full `SourceLocation` (first and last line) pointed at by
    /// `addr`, using the version-specific byte layout. Null pointers at any
    /// step decode to the absent location, never an error.
    fn read_location_full(&self, addr: u64) -> Result<SourceLocation, IntrospectionError> {
        if addr == 0 {
            return Ok(SourceLocation::default());
        }
        let data = self.mem.peek(addr, self.layout.location_size)?;
        let filename_ptr_offset = self.layout.location_filename;
        let filename_ptr =
            u64::from_le_bytes(data[filename_ptr_offset..filename_ptr_offset + 8].try_into().unwrap());
        if filename_ptr == 0 {
            return Ok(SourceLocation::default());
        }
        let filename = normalize_path(&self.mem.read_cstring(filename_ptr)?);
        let first_line_offset = self.layout.location_first_line;
        let last_line_offset = self.layout.location_last_line;
        let first_line =
            i32::from_le_bytes(data[first_line_offset..first_line_offset + 4].try_into().unwrap()) as i64;
        let last_line =
            i32::from_le_bytes(data[last_line_offset..last_line_offset + 4].try_into().unwrap()) as i64;
        Ok(SourceLocation { filename, first_line, last_line })
    }
}

/// `filepath.Clean`-equivalent normalization: collapses `./`, `../`, and
/// redundant separators so the same source file reported from different
/// call sites interns to one string.
fn normalize_path(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }
    let absolute = raw.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for component in raw.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                if !parts.is_empty() && *parts.last().unwrap() != ".." {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
                // Rooted paths can't escape root: a leading `..` is dropped.
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if raw.starts_with('/') {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::FakeMemoryBuilder;
    use crate::core::offsets;

    fn layout_3_1() -> LayoutDescriptor {
        offsets::lookup("3.1.0").unwrap()
    }

    fn image(call_stack_addr: u64, frame_stack_addr: u64) -> ZeekImage {
        ZeekImage {
            exe: "/usr/bin/zeek".into(),
            load_addr: 0,
            call_stack_addr,
            frame_stack_addr,
            version_addr: 0xa000,
        }
    }

    #[test]
    fn empty_call_stack_yields_placeholder_frame() {
        let mut mem = FakeMemoryBuilder::new();
        let call_stack_addr = 0x1000;
        mem.vector_header(call_stack_addr, 0x2000, 0x2000); // start == finish

        let img = image(call_stack_addr, 0x3000);
        let mem = mem.build();
        let recon = StackReconstructor::new(&mem, &img, layout_3_1());
        let (stack, empty_flag) = recon.sample().unwrap();
        assert!(empty_flag);
        assert_eq!(stack.len(), 1);
        assert_eq!(stack[0].function.name, "<empty_call_stack>");
    }

    #[test]
    fn single_frame_with_script_location() {
        let mut mem = FakeMemoryBuilder::new();

        let call_stack_addr = 0x1000;
        let vec_data_addr = 0x2000;
        let func_addr = 0x3000;
        let loc_addr = 0x4000;
        let filename_addr = 0x5000;

        mem.vector_header(call_stack_addr, vec_data_addr, vec_data_addr + 24);
        mem.call_info(vec_data_addr, 0, func_addr);
        mem.func_object(func_addr, 0 /* script */, "dns_full", loc_addr);
        // 3.1 layout: filename@0, first_line@8, last_line@12
        mem.location_3_1(loc_addr, filename_addr, 42, 50);
        mem.cstring(filename_addr, "test.zeek");

        let frame_stack_addr = 0x9000;
        mem.vector_header(frame_stack_addr, 0x9100, 0x9108);
        mem.ptr_at(0x9100, 0x9200); // frame ptr
        mem.ptr_at(0x9200 + 144, 0); // next_stmt == null, skip refinement

        let img = image(call_stack_addr, frame_stack_addr);
        let mem = mem.build();
        let recon = StackReconstructor::new(&mem, &img, layout_3_1());
        let (stack, empty_flag) = recon.sample().unwrap();

        assert!(!empty_flag);
        assert_eq!(stack.len(), 1);
        assert_eq!(stack[0].function.name, "dns_full");
        assert_eq!(stack[0].function.kind, FunctionKind::Script);
        assert_eq!(stack[0].attribution(), ("test.zeek", 42));
    }

    #[test]
    fn builtin_dispatch_prepends_synthetic_frame() {
        let mut mem = FakeMemoryBuilder::new();

        let call_stack_addr = 0x1000;
        let vec_data_addr = 0x2000;
        let func_addr = 0x3000;
        let builtin_loc_addr = 0x4000;
        let builtin_filename_addr = 0x5000;
        let call_site_filename_addr = 0x6000;

        mem.vector_header(call_stack_addr, vec_data_addr, vec_data_addr + 24);
        mem.call_info(vec_data_addr, 0, func_addr);
        mem.func_object(func_addr, 1 /* builtin */, "dns_message", builtin_loc_addr);
        mem.location_3_1(builtin_loc_addr, builtin_filename_addr, 442, 450);
        mem.cstring(builtin_filename_addr, "dns.bif");
        mem.cstring(call_site_filename_addr, "listen.zeek");

        // refine_leaf reads next_statement via the frame vector and resolves
        // it to a Location whose filename differs from the builtin's home.
        let frame_stack_addr = 0x9000;
        mem.vector_header(frame_stack_addr, 0x9100, 0x9108);
        mem.ptr_at(0x9100, 0x9200);
        let next_stmt_addr: u64 = 0x9300;
        mem.ptr_at(0x9200 + 144, next_stmt_addr);
        mem.interp_object(next_stmt_addr, 0x4100);
        mem.location_3_1(0x4100, call_site_filename_addr, 10, 10);

        let img = image(call_stack_addr, frame_stack_addr);
        let mem = mem.build();
        let recon = StackReconstructor::new(&mem, &img, layout_3_1());
        let (stack, _) = recon.sample().unwrap();

        assert_eq!(stack.len(), 2);
        assert_eq!(stack[0].function.name, "dns_message");
        assert_eq!(stack[0].attribution(), ("dns.bif", 442));
        assert_eq!(stack[1].function.name, "dns_message");
        assert_eq!(stack[1].function.location.filename, "listen.zeek");
        assert_eq!(stack[1].function.location.first_line, 0);
        assert_eq!(stack[1].attribution(), ("listen.zeek", 10));
    }

    #[test]
    fn normalize_path_collapses_dot_segments() {
        assert_eq!(normalize_path("./scripts/../base/init.zeek"), "base/init.zeek");
        assert_eq!(normalize_path("/a/./b/"), "/a/b");
        assert_eq!(normalize_path(""), "");
    }

    #[test]
    fn normalize_path_clamps_leading_dotdot_at_root() {
        assert_eq!(normalize_path("/../etc/passwd"), "/etc/passwd");
        assert_eq!(normalize_path("/../../a"), "/a");
        assert_eq!(normalize_path("../a"), "../a");
    }
}
