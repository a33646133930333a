//! The load algorithm itself: `loader.cc`'s `LoadElfProgram` re-expressed
//! over this tree's primitives. Per-module, read-only and writable
//! `PT_LOAD` segments are both materialised as fresh private pages in the
//! child (see the module doc comment for why the original's
//! joined-shared-segment sharing for read-only segments doesn't carry over
//! as-is); everything else - dependency walking, symbol collection with
//! weak-symbol precedence, relocation fixups, and init/fini table
//! synthesis - follows the original step for step.

use alloc::collections::{BTreeMap, BTreeSet, VecDeque};
use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use perception::{mem, process};
use perception_abi::{Error, Pid, ProcessFlags};

use crate::cache::{canonical_name, ElfCache};
use crate::elf::{self, ElfImage};

const PAGE: u64 = mem::PAGE_SIZE;

struct ChildPage {
    loader_va: u64,
    writable: bool,
}

type ChildPages = BTreeMap<u64, ChildPage>;

#[derive(Default)]
struct InitFiniTables {
    preinit_arrays: Vec<(u64, u64)>,
    init_arrays: Vec<(u64, u64)>,
    fini_arrays: Vec<(u64, u64)>,
    init_functions: Vec<(u64, u64)>,
    fini_functions: Vec<(u64, u64)>,
}

/// One module's contribution to the init/fini tables, collected before
/// ordering is decided: a dependency's preinit/init/`DT_INIT` entries run
/// *before* the executable's own (the C runtime initializes what a module
/// depends on first), while fini entries run in the opposite order, so the
/// two halves can't be merged by a single pass over executable-then-deps.
#[derive(Default)]
struct ModuleTables {
    preinit_array: Option<(u64, u64)>,
    init_array: Option<(u64, u64)>,
    fini_array: Option<(u64, u64)>,
    init_function: Option<(u64, u64)>,
    fini_function: Option<(u64, u64)>,
}

fn resolve_executable_path(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/Applications/{name}")
    }
}

fn resolve_library_path(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/Libraries/{name}")
    }
}

/// Loads `name` (and its transitive `NEEDED` closure), starts it as a new
/// child process, and returns that child's pid. On any failure prior to
/// `start_execution`, the child and every page staged for it are released.
pub fn launch_application(cache: &mut ElfCache, name: &str) -> Result<Pid, Error> {
    let executable_path = resolve_executable_path(name);
    let executable = cache.load_or_increment(&executable_path)?;
    if !executable.is_executable() {
        return Err(Error::InvalidArgument);
    }

    let dependencies = load_dependencies(cache, &executable)?;

    // The device manager that the original flags drivers through is out of
    // scope here (see `spec.md`'s own non-goal); every child this loader
    // creates is a plain application.
    let child = process::create_process(canonical_name(&executable_path).as_bytes(), ProcessFlags::empty())?;

    match assemble_and_start(child, &executable, &dependencies) {
        Ok(()) => {
            cache.compact();
            Ok(child)
        }
        Err(e) => {
            let _ = process::destroy_child_process(child);
            Err(e)
        }
    }
}

fn load_dependencies(cache: &mut ElfCache, executable: &ElfImage) -> Result<Vec<Arc<ElfImage>>, Error> {
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    for name in executable.dependent_libraries() {
        if seen.insert(name.clone()) {
            queue.push_back(name);
        }
    }

    let mut loaded = Vec::new();
    while let Some(name) = queue.pop_front() {
        let lib = cache.load_or_increment(&resolve_library_path(&name))?;
        for dep in lib.dependent_libraries() {
            if seen.insert(dep.clone()) {
                queue.push_back(dep);
            }
        }
        loaded.push(lib);
    }
    Ok(loaded)
}

fn release_all(pages: &ChildPages) {
    for page in pages.values() {
        let _ = mem::release_pages(page.loader_va);
    }
}

fn checked<T>(result: Result<T, Error>, pages: &ChildPages) -> Result<T, Error> {
    if result.is_err() {
        release_all(pages);
    }
    result
}

fn assemble_and_start(child: Pid, executable: &ElfImage, dependencies: &[Arc<ElfImage>]) -> Result<(), Error> {
    let mut pages: ChildPages = BTreeMap::new();
    let mut symbols: BTreeMap<String, u64> = BTreeMap::new();

    checked(load_segments(executable, 0, &mut pages), &pages)?;
    collect_symbols(executable, 0, &mut symbols);
    let executable_tables = module_tables(executable, 0);
    let mut next_free = executable.highest_virtual_address();

    let mut module_offsets = Vec::with_capacity(dependencies.len());
    let mut dependency_tables = Vec::with_capacity(dependencies.len());
    for dep in dependencies {
        let offset = next_free;
        module_offsets.push(offset);
        checked(load_segments(dep, offset, &mut pages), &pages)?;
        collect_symbols(dep, offset, &mut symbols);
        dependency_tables.push(module_tables(dep, offset));
        next_free = offset + dep.highest_virtual_address();
    }
    let tables = order_tables(executable_tables, &dependency_tables);

    checked(write_init_fini_tables(&tables, next_free, &mut pages, &mut symbols).map(|_| ()), &pages)?;

    checked(fixup_relocations(executable, 0, &symbols, 0, &mut pages), &pages)?;
    for (i, dep) in dependencies.iter().enumerate() {
        checked(fixup_relocations(dep, module_offsets[i], &symbols, (i + 1) as u64, &mut pages), &pages)?;
    }

    transfer_pages(child, pages)?;
    process::start_execution(child, executable.entry_point())?;
    Ok(())
}

fn transfer_pages(child: Pid, pages: ChildPages) -> Result<(), Error> {
    let mut iter = pages.into_iter();
    for (child_addr, page) in iter.by_ref() {
        if let Err(e) = process::set_child_memory_page(child, page.loader_va, child_addr, page.writable) {
            let _ = mem::release_pages(page.loader_va);
            for (_, remaining) in iter {
                let _ = mem::release_pages(remaining.loader_va);
            }
            return Err(e);
        }
    }
    Ok(())
}

fn get_or_alloc_page(pages: &mut ChildPages, child_page_addr: u64, writable: bool) -> Result<u64, Error> {
    if let Some(existing) = pages.get(&child_page_addr) {
        return Ok(existing.loader_va);
    }
    let loader_va = mem::allocate_pages(1)?;
    pages.insert(child_page_addr, ChildPage { loader_va, writable });
    Ok(loader_va)
}

fn copy_into_memory(pages: &mut ChildPages, data: &[u8], address: u64, writable: bool) -> Result<(), Error> {
    let address_end = address + data.len() as u64;
    let mut page = address & !(PAGE - 1);
    let mut copied = 0usize;
    while page < address_end {
        let loader_va = get_or_alloc_page(pages, page, writable)?;
        let start = if address > page { (address - page) as usize } else { 0 };
        let finish = if page + PAGE > address_end { (address_end - page) as usize } else { PAGE as usize };
        let len = finish - start;
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr().add(copied), (loader_va as *mut u8).add(start), len) };
        copied += len;
        page += PAGE;
    }
    Ok(())
}

fn zero_memory(pages: &mut ChildPages, address: u64, size: u64, writable: bool) -> Result<(), Error> {
    let address_end = address + size;
    let mut page = address & !(PAGE - 1);
    while page < address_end {
        let loader_va = get_or_alloc_page(pages, page, writable)?;
        let start = if address > page { (address - page) as usize } else { 0 };
        let finish = if page + PAGE > address_end { (address_end - page) as usize } else { PAGE as usize };
        unsafe { core::ptr::write_bytes((loader_va as *mut u8).add(start), 0, finish - start) };
        page += PAGE;
    }
    Ok(())
}

fn load_segments(image: &ElfImage, offset: u64, pages: &mut ChildPages) -> Result<(), Error> {
    for ph in image.program_headers() {
        if ph.ph_type() != elf_rs::ProgramType::LOAD {
            continue;
        }
        let writable = ph.flags() & 0b10 != 0;
        let vaddr = ph.vaddr() + offset;

        if ph.filesz() > 0 {
            let start = ph.offset() as usize;
            let end = start + ph.filesz() as usize;
            let data = image.as_bytes().get(start..end).ok_or(Error::InvalidArgument)?;
            copy_into_memory(pages, data, vaddr, writable)?;
        }
        if ph.memsz() > ph.filesz() {
            zero_memory(pages, vaddr + ph.filesz(), ph.memsz() - ph.filesz(), writable)?;
        }
    }
    Ok(())
}

fn collect_symbols(image: &ElfImage, offset: u64, symbols: &mut BTreeMap<String, u64>) {
    for (name, sym) in image.exported_symbols() {
        merge_symbol(symbols, name, sym.bind(), sym.value + offset);
    }
}

/// Inserts `name` -> `value`, unless `name` is already bound and the new
/// definition is weak: a weak symbol never overrides an existing stronger
/// (or equally ordered) one, matching `elf_file.cc`'s merge order across
/// the executable and every dependency loaded after it.
fn merge_symbol(symbols: &mut BTreeMap<String, u64>, name: String, bind: u8, value: u64) {
    if bind != elf::STB_WEAK || !symbols.contains_key(&name) {
        symbols.insert(name, value);
    }
}

fn module_tables(image: &ElfImage, offset: u64) -> ModuleTables {
    ModuleTables {
        preinit_array: image.preinit_array().map(|a| (a.addr + offset, a.count)),
        init_array: image.init_array().map(|a| (a.addr + offset, a.count)),
        fini_array: image.fini_array().map(|a| (a.addr + offset, a.count)),
        init_function: image.init_function().map(|a| (a.addr + offset, a.count)),
        fini_function: image.fini_function().map(|a| (a.addr + offset, a.count)),
    }
}

/// Orders every module's tables into the five published lists: dependencies
/// before the executable for preinit/init (a dependency initializes before
/// what depends on it), the executable before dependencies for fini (the
/// reverse - it finalizes before what it depends on).
fn order_tables(executable: ModuleTables, dependencies: &[ModuleTables]) -> InitFiniTables {
    let mut tables = InitFiniTables::default();

    for dep in dependencies {
        extend(&mut tables.preinit_arrays, dep.preinit_array);
        extend(&mut tables.init_arrays, dep.init_array);
        extend(&mut tables.init_functions, dep.init_function);
    }
    extend(&mut tables.preinit_arrays, executable.preinit_array);
    extend(&mut tables.init_arrays, executable.init_array);
    extend(&mut tables.init_functions, executable.init_function);

    extend(&mut tables.fini_arrays, executable.fini_array);
    extend(&mut tables.fini_functions, executable.fini_function);
    for dep in dependencies {
        extend(&mut tables.fini_arrays, dep.fini_array);
        extend(&mut tables.fini_functions, dep.fini_function);
    }

    tables
}

fn extend(list: &mut Vec<(u64, u64)>, entry: Option<(u64, u64)>) {
    if let Some(entry) = entry {
        list.push(entry);
    }
}

fn write_u64(pages: &mut ChildPages, cursor: &mut u64, value: u64) -> Result<(), Error> {
    let page = *cursor & !(PAGE - 1);
    let offset_in_page = (*cursor & (PAGE - 1)) as usize;
    let loader_va = get_or_alloc_page(pages, page, true)?;
    unsafe { *((loader_va as *mut u8).add(offset_in_page) as *mut u64) = value };
    *cursor += 8;
    Ok(())
}

fn write_array_of_arrays(pages: &mut ChildPages, cursor: &mut u64, arrays: &[(u64, u64)]) -> Result<(), Error> {
    write_u64(pages, cursor, arrays.len() as u64)?;
    for (addr, count) in arrays {
        write_u64(pages, cursor, *addr)?;
        write_u64(pages, cursor, *count)?;
    }
    Ok(())
}

fn write_functions(pages: &mut ChildPages, cursor: &mut u64, functions: &[(u64, u64)]) -> Result<(), Error> {
    write_u64(pages, cursor, functions.len() as u64)?;
    for (addr, _len) in functions {
        write_u64(pages, cursor, *addr)?;
    }
    Ok(())
}

/// Synthesises the init/fini table a C runtime enumerates at process
/// start: preinit/init/fini array-of-arrays, then appended init and fini
/// function lists, published as special symbols so relocations can
/// reference them directly (matching `loader.cc`'s
/// `CreateInitAndFiniArrays`, which writes into the same
/// `symbols_to_addresses` map used for ordinary symbol resolution).
fn write_init_fini_tables(tables: &InitFiniTables, start_address: u64, pages: &mut ChildPages, symbols: &mut BTreeMap<String, u64>) -> Result<u64, Error> {
    let mut cursor = start_address;

    symbols.insert("__preinit_array_of_arrays".to_string(), cursor);
    write_array_of_arrays(pages, &mut cursor, &tables.preinit_arrays)?;
    symbols.insert("__init_array_of_arrays".to_string(), cursor);
    write_array_of_arrays(pages, &mut cursor, &tables.init_arrays)?;
    symbols.insert("__fini_array_of_arrays".to_string(), cursor);
    write_array_of_arrays(pages, &mut cursor, &tables.fini_arrays)?;
    symbols.insert("__init_functions".to_string(), cursor);
    write_functions(pages, &mut cursor, &tables.init_functions)?;
    symbols.insert("__fini_functions".to_string(), cursor);
    write_functions(pages, &mut cursor, &tables.fini_functions)?;

    Ok(cursor)
}

/// Computes the 8-byte value one relocation resolves to, per the five
/// kinds `spec.md` §4.L supports. `defined` is the already-offset value of
/// the relocation's symbol when it's defined in this same module (`Some`),
/// or `None` when it's `SHN_UNDEF` and must come from `symbols` by name.
fn relocation_value(kind: u32, addend: i64, offset: u64, module_id: u64, defined: Option<u64>, undefined_name: Option<&str>, undefined_is_weak: bool, symbols: &BTreeMap<String, u64>) -> Result<u64, Error> {
    match kind {
        elf::R_X86_64_64 | elf::R_X86_64_GLOB_DAT | elf::R_X86_64_JUMP_SLOT => {
            let mut value = match defined {
                Some(v) => v,
                None => {
                    let name = undefined_name.ok_or(Error::InternalError)?;
                    match symbols.get(name) {
                        Some(addr) => *addr,
                        None if undefined_is_weak => 0,
                        None => return Err(Error::InvalidArgument),
                    }
                }
            };
            if kind == elf::R_X86_64_64 {
                value = value.wrapping_add(addend as u64);
            }
            Ok(value)
        }
        elf::R_X86_64_RELATIVE => Ok((addend as u64).wrapping_add(offset)),
        elf::R_X86_64_DTPMOD64 => Ok(module_id),
        _ => Err(Error::Unimplemented),
    }
}

fn fixup_relocations(image: &ElfImage, offset: u64, symbols: &BTreeMap<String, u64>, module_id: u64, pages: &mut ChildPages) -> Result<(), Error> {
    for rela in image.relocations() {
        let needs_symbol = matches!(rela.kind, elf::R_X86_64_64 | elf::R_X86_64_GLOB_DAT | elf::R_X86_64_JUMP_SLOT);
        let (defined, undefined_name, is_weak) = if needs_symbol {
            let sym = image.relocation_symbol(&rela).ok_or(Error::InternalError)?;
            let defined = (sym.shndx != elf::SHN_UNDEF).then(|| sym.value + offset);
            let undefined_name = (sym.shndx == elf::SHN_UNDEF).then(|| image.sym_name(&sym)).flatten();
            (defined, undefined_name, sym.bind() == elf::STB_WEAK)
        } else {
            (None, None, false)
        };
        let value = relocation_value(rela.kind, rela.addend, offset, module_id, defined, undefined_name, is_weak, symbols)?;

        let address = rela.offset + offset;
        if address % 8 != 0 {
            return Err(Error::InternalError);
        }
        let page = address & !(PAGE - 1);
        let offset_in_page = (address & (PAGE - 1)) as usize;
        let loader_va = pages.get(&page).ok_or(Error::InternalError)?.loader_va;
        unsafe { *((loader_va as *mut u8).add(offset_in_page) as *mut u64) = value };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weak_symbol_does_not_override_existing() {
        let mut symbols = BTreeMap::new();
        merge_symbol(&mut symbols, "foo".to_string(), elf::STB_WEAK, 0x1000);
        merge_symbol(&mut symbols, "foo".to_string(), 1 /* STB_GLOBAL */, 0x2000);
        merge_symbol(&mut symbols, "foo".to_string(), elf::STB_WEAK, 0x3000);
        assert_eq!(symbols["foo"], 0x2000);
    }

    #[test]
    fn first_definition_wins_when_all_weak() {
        let mut symbols = BTreeMap::new();
        merge_symbol(&mut symbols, "bar".to_string(), elf::STB_WEAK, 0x10);
        merge_symbol(&mut symbols, "bar".to_string(), elf::STB_WEAK, 0x20);
        assert_eq!(symbols["bar"], 0x10);
    }

    #[test]
    fn relative_relocation_adds_load_offset() {
        let symbols = BTreeMap::new();
        let value = relocation_value(elf::R_X86_64_RELATIVE, 0x40, 0x1000_0000, 0, None, None, false, &symbols).unwrap();
        assert_eq!(value, 0x1000_0040);
    }

    #[test]
    fn dtpmod64_returns_module_id() {
        let symbols = BTreeMap::new();
        let value = relocation_value(elf::R_X86_64_DTPMOD64, 0, 0, 3, None, None, false, &symbols).unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn undefined_weak_symbol_resolves_to_zero() {
        let symbols = BTreeMap::new();
        let value = relocation_value(elf::R_X86_64_GLOB_DAT, 0, 0, 0, None, Some("missing"), true, &symbols).unwrap();
        assert_eq!(value, 0);
    }

    #[test]
    fn undefined_non_weak_symbol_fails() {
        let symbols = BTreeMap::new();
        let result = relocation_value(elf::R_X86_64_JUMP_SLOT, 0, 0, 0, None, Some("missing"), false, &symbols);
        assert_eq!(result, Err(Error::InvalidArgument));
    }

    #[test]
    fn resolves_undefined_symbol_from_earlier_module() {
        let mut symbols = BTreeMap::new();
        symbols.insert("printf".to_string(), 0x5000);
        let value = relocation_value(elf::R_X86_64_GLOB_DAT, 0, 0, 1, None, Some("printf"), false, &symbols).unwrap();
        assert_eq!(value, 0x5000);
    }

    #[test]
    fn init_arrays_list_dependency_before_executable() {
        let executable = ModuleTables { init_array: Some((0x1000, 1)), ..Default::default() };
        let dependency = ModuleTables { init_array: Some((0x2000, 1)), ..Default::default() };
        let tables = order_tables(executable, &[dependency]);
        assert_eq!(tables.init_arrays, alloc::vec![(0x2000, 1), (0x1000, 1)]);
    }

    #[test]
    fn fini_arrays_list_executable_before_dependency() {
        let executable = ModuleTables { fini_array: Some((0x1000, 1)), ..Default::default() };
        let dependency = ModuleTables { fini_array: Some((0x2000, 1)), ..Default::default() };
        let tables = order_tables(executable, &[dependency]);
        assert_eq!(tables.fini_arrays, alloc::vec![(0x1000, 1), (0x2000, 1)]);
    }

    #[test]
    fn abs64_adds_addend_to_defined_symbol() {
        let symbols = BTreeMap::new();
        let value = relocation_value(elf::R_X86_64_64, 8, 0x2000, 0, Some(0x2000 + 0x100), None, false, &symbols).unwrap();
        assert_eq!(value, 0x2108);
    }
}
