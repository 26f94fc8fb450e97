//! Function name and entry point resolution from the target's ELF + DWARF.

use crate::error::{Error, Result};
use gimli::{AttributeValue, DebuggingInformationEntry, Dwarf, Reader as _, RunTimeEndian, Unit};
use goblin::elf::Elf;
use log::{debug, warn};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::rc::Rc;

type Reader = gimli::EndianRcSlice<RunTimeEndian>;

/// Symbol lookups over the debug info of the target's executable.
///
/// Missing or unreadable DWARF is not an error: name lookups degrade to
/// empty results and entry-point lookups report the function as not found.
pub struct Symbolizer {
    dwarf: Option<Dwarf<Reader>>,
    // symbol resolution is a DIE scan per miss, so hits are memoized
    names: RefCell<HashMap<u64, String>>,
}

impl Symbolizer {
    /// Builds a symbolizer from a parsed executable image.
    ///
    /// The debug sections are copied out of `image`, so the symbolizer
    /// does not borrow it.
    pub fn new(elf: &Elf<'_>, image: &[u8]) -> Symbolizer {
        let endian = if elf.little_endian {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        let load = |id: gimli::SectionId| -> std::result::Result<Reader, gimli::Error> {
            Ok(Reader::new(section_bytes(elf, image, id.name()), endian))
        };

        let dwarf = match Dwarf::load(load) {
            Ok(dwarf) => Some(dwarf),
            Err(e) => {
                warn!("load dwarf error: {}", e);
                None
            }
        };

        Symbolizer {
            dwarf,
            names: RefCell::new(HashMap::new()),
        }
    }

    /// Returns the name of the innermost function whose PC range contains
    /// `address`, or an empty string if there is none.
    ///
    /// `address` is a link-time address; callers strip any load offset
    /// first. Results, including misses, are memoized.
    pub fn function_name_at(&self, address: u64) -> String {
        if let Some(name) = self.names.borrow().get(&address) {
            return name.clone();
        }

        let name = match self.lookup_name(address) {
            Ok(Some(name)) => name,
            Ok(None) => String::new(),
            Err(e) => {
                debug!("symbol lookup at {:#x} failed: {}", address, e);
                String::new()
            }
        };

        self.names.borrow_mut().insert(address, name.clone());
        name
    }

    fn lookup_name(&self, address: u64) -> Result<Option<String>> {
        let dwarf = match self.dwarf {
            Some(ref dwarf) => dwarf,
            None => return Ok(None),
        };

        let mut units = dwarf.units();
        while let Some(header) = units.next()? {
            let unit = dwarf.unit(header)?;

            let root_range = {
                let mut entries = unit.entries();
                match entries.next_dfs()? {
                    Some((_, root)) => match die_pc_range(dwarf, &unit, root)? {
                        Some(range) => range,
                        None => continue,
                    },
                    None => continue,
                }
            };
            if address < root_range.0 || address >= root_range.1 {
                continue;
            }

            let mut best: Option<(u64, String)> = None;
            let mut entries = unit.entries();
            while let Some((_, entry)) = entries.next_dfs()? {
                if entry.tag() == gimli::DW_TAG_compile_unit {
                    continue;
                }
                let (low, high) = match die_pc_range(dwarf, &unit, entry)? {
                    Some(range) => range,
                    None => continue,
                };
                if address < low || address >= high {
                    continue;
                }
                let name = match die_name(dwarf, &unit, entry)? {
                    Some(name) => name,
                    None => continue,
                };
                let size = high - low;
                if best.as_ref().map_or(true, |(best_size, _)| size <= *best_size) {
                    best = Some((size, name));
                }
            }

            if let Some((_, name)) = best {
                return Ok(Some(name));
            }
        }
        Ok(None)
    }

    /// Resolves the entry address of the function named `func` through the
    /// line table.
    ///
    /// With `skip_prologue`, the address of the line entry after the one at
    /// the function's `low_pc` is returned instead, which lands past the
    /// compiler-generated prologue. The result is a link-time address.
    pub fn find_function_entry(&self, func: &str, skip_prologue: bool) -> Result<u64> {
        let dwarf = self
            .dwarf
            .as_ref()
            .ok_or_else(|| Error::NotFound(format!("function {} not found", func)))?;

        let mut units = dwarf.units();
        while let Some(header) = units.next()? {
            let unit = dwarf.unit(header)?;
            let mut entries = unit.entries();
            while let Some((_, entry)) = entries.next_dfs()? {
                if entry.tag() == gimli::DW_TAG_compile_unit {
                    continue;
                }
                if die_name(dwarf, &unit, entry)?.as_deref() != Some(func) {
                    continue;
                }
                let (low, _) = match die_pc_range(dwarf, &unit, entry)? {
                    Some(range) => range,
                    None => continue,
                };
                return line_entry_address(&unit, low, skip_prologue);
            }
        }
        Err(Error::NotFound(format!("function {} not found", func)))
    }
}

fn line_entry_address(unit: &Unit<Reader>, pc: u64, skip_prologue: bool) -> Result<u64> {
    let program = unit
        .line_program
        .clone()
        .ok_or_else(|| Error::NotFound("cannot find line entry".to_string()))?;

    let mut addresses = Vec::new();
    let mut rows = program.rows();
    while let Some((_, row)) = rows.next_row()? {
        if !row.end_sequence() {
            addresses.push(row.address());
        }
    }
    addresses.sort_unstable();
    addresses.dedup();

    let index = match addresses.binary_search(&pc) {
        Ok(index) => index,
        Err(index) if index > 0 => index - 1,
        Err(_) => return Err(Error::NotFound("cannot find line entry".to_string())),
    };
    let index = if skip_prologue { index + 1 } else { index };

    addresses
        .get(index)
        .copied()
        .ok_or_else(|| Error::NotFound("cannot find line entry".to_string()))
}

fn section_bytes(elf: &Elf<'_>, image: &[u8], name: &str) -> Rc<[u8]> {
    for header in &elf.section_headers {
        if elf.shdr_strtab.get_at(header.sh_name) != Some(name) {
            continue;
        }
        if let Some(range) = header.file_range() {
            if let Some(data) = image.get(range) {
                return Rc::from(data);
            }
        }
    }
    Rc::from(&[][..])
}

fn die_pc_range(
    dwarf: &Dwarf<Reader>,
    unit: &Unit<Reader>,
    entry: &DebuggingInformationEntry<'_, '_, Reader>,
) -> Result<Option<(u64, u64)>> {
    let low = match entry.attr_value(gimli::DW_AT_low_pc)? {
        Some(AttributeValue::Addr(addr)) => addr,
        Some(AttributeValue::DebugAddrIndex(index)) => dwarf.address(unit, index)?,
        _ => return Ok(None),
    };
    let high = match entry.attr_value(gimli::DW_AT_high_pc)? {
        Some(AttributeValue::Addr(addr)) => addr,
        Some(AttributeValue::Udata(size)) => low + size,
        _ => return Ok(None),
    };
    Ok(Some((low, high)))
}

fn die_name(
    dwarf: &Dwarf<Reader>,
    unit: &Unit<Reader>,
    entry: &DebuggingInformationEntry<'_, '_, Reader>,
) -> Result<Option<String>> {
    let attr = match entry.attr(gimli::DW_AT_name)? {
        Some(attr) => attr,
        None => return Ok(None),
    };
    match dwarf.attr_string(unit, attr.value()) {
        Ok(s) => Ok(Some(s.to_string_lossy()?.into_owned())),
        Err(_) => Ok(None),
    }
}

/// Finds the runtime load address of a process's executable image.
///
/// The first executable mapping in `/proc/<pid>/maps` whose pathname equals
/// the canonicalized `/proc/<pid>/exe` is the text segment of the main
/// image.
pub fn base_address(pid: u32) -> Result<u64> {
    let exe = fs::canonicalize(format!("/proc/{}/exe", pid)).map_err(|e| Error::Api {
        context: format!("resolve executable of process {}", pid),
        source: e,
    })?;
    let maps = fs::read_to_string(format!("/proc/{}/maps", pid)).map_err(|e| Error::Api {
        context: format!("read memory map of process {}", pid),
        source: e,
    })?;

    find_base(&maps, &exe)
        .ok_or_else(|| Error::NotFound(format!("base address of process {}", pid)))
}

fn find_base(maps: &str, exe: &Path) -> Option<u64> {
    for line in maps.lines() {
        let (start, perms, path) = match parse_maps_line(line) {
            Some(region) => region,
            None => continue,
        };
        if perms.contains('x') && path == Some(&*exe.to_string_lossy()) {
            return Some(start);
        }
    }
    None
}

fn parse_maps_line(line: &str) -> Option<(u64, &str, Option<&str>)> {
    let mut parts = line.split_whitespace();
    let range = parts.next()?;
    let perms = parts.next()?;
    let _offset = parts.next()?;
    let _dev = parts.next()?;
    let _inode = parts.next()?;
    let path = parts.next();

    let (start, _end) = range.split_once('-')?;
    Some((u64::from_str_radix(start, 16).ok()?, perms, path))
}
