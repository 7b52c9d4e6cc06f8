//! Per-table B+tree keyed by the encoded primary key.
//!
//! Nodes live on slotted pages. A leaf page header is
//! `[tag][slot count u16][cell start u16][prev leaf u32][next leaf u32]`,
//! an internal page header is
//! `[tag][slot count u16][cell start u16][rightmost child u32]`.
//! The slot directory (u16 offset + u16 length per cell) grows down from
//! the header; cell bytes grow up from the page end.
//!
//! Leaf cells hold `[key len u16][key][flag][payload]` where the payload is
//! inline row bytes or an overflow-chain head. Internal cells hold
//! `[key len u16][key][child u32]`: the cell's subtree has keys below the
//! cell key, the page's rightmost child takes everything at or above the
//! last separator.

use std::cmp::Ordering;

use tinydb_store::page::{Page, PageKind};
use tinydb_store::{PageNo, Pager, NO_PAGE, PAGE_SIZE};

use crate::error::{Error, Result};
use crate::key;

const SLOT_COUNT_OFFSET: usize = 1;
const CELL_START_OFFSET: usize = 3;
const LEAF_PREV_OFFSET: usize = 5;
const LEAF_NEXT_OFFSET: usize = 9;
const LEAF_HEADER_BYTES: usize = 13;
const RIGHTMOST_OFFSET: usize = 5;
const INTERNAL_HEADER_BYTES: usize = 9;
const SLOT_BYTES: usize = 4;

const PAYLOAD_INLINE: u8 = 0;
const PAYLOAD_OVERFLOW: u8 = 1;

/// Payloads above this spill into an overflow chain.
pub const MAX_INLINE_PAYLOAD: usize = PAGE_SIZE / 8;
/// Encoded primary keys must stay node-resident.
pub const MAX_KEY_BYTES: usize = PAGE_SIZE / 16;

/// Result of an insert one level down: the child split and handed up a
/// separator plus its new right sibling.
struct Split {
    sep: Vec<u8>,
    right: PageNo,
}

#[derive(Debug, Clone, Copy)]
pub struct BTree {
    pub root: PageNo,
}

#[derive(Debug, PartialEq, Eq)]
pub struct TreeStats {
    pub depth: usize,
    pub entries: u64,
    pub pages: u64,
}

impl BTree {
    /// Allocates an empty tree: a single leaf root.
    pub fn create(pager: &mut Pager) -> Result<BTree> {
        let root = pager.allocate_page(PageKind::BTreeLeaf)?;
        let mut page = Page::new(root, PageKind::BTreeLeaf);
        init_leaf(&mut page);
        pager.write_page(page)?;
        Ok(BTree { root })
    }

    pub fn open(root: PageNo) -> BTree {
        BTree { root }
    }

    pub fn find(&self, pager: &mut Pager, target: &[u8]) -> Result<Option<Vec<u8>>> {
        let leaf_no = descend_to_leaf(pager, self.root, Some(target), true)?;
        let leaf = pager.read_page(leaf_no)?;
        let (idx, exact) = search_leaf(&leaf, target)?;
        if !exact {
            return Ok(None);
        }
        let cell = cell_bytes(&leaf, idx).to_vec();
        Ok(Some(read_leaf_payload(pager, &cell)?))
    }

    pub fn insert(&self, pager: &mut Pager, target: &[u8], payload: &[u8]) -> Result<()> {
        if target.len() > MAX_KEY_BYTES {
            return Err(Error::Constraint(format!(
                "encoded primary key is {} bytes (limit {MAX_KEY_BYTES})",
                target.len()
            )));
        }
        match insert_rec(pager, self.root, target, payload)? {
            None => Ok(()),
            Some(split) => self.grow_root(pager, split),
        }
    }

    pub fn delete(&self, pager: &mut Pager, target: &[u8]) -> Result<()> {
        delete_rec(pager, self.root, target)?;
        self.collapse_root(pager)
    }

    /// Overwrites the payload for an existing key; splits only when the new
    /// encoding no longer fits in place.
    pub fn update(&self, pager: &mut Pager, target: &[u8], payload: &[u8]) -> Result<()> {
        let leaf_no = descend_to_leaf(pager, self.root, Some(target), true)?;
        let mut leaf = pager.read_page(leaf_no)?;
        let (idx, exact) = search_leaf(&leaf, target)?;
        if !exact {
            return Err(Error::NotFound("key not found".into()));
        }

        let old_cell = cell_bytes(&leaf, idx).to_vec();
        let new_cell = build_leaf_cell(pager, target, payload)?;
        let available = free_space(&leaf) + old_cell.len() + SLOT_BYTES;
        if new_cell.len() + SLOT_BYTES <= available {
            free_cell_overflow(pager, &old_cell)?;
            remove_cell(&mut leaf, idx);
            let ok = insert_cell(&mut leaf, idx, &new_cell);
            debug_assert!(ok);
            pager.write_page(leaf)?;
            return Ok(());
        }
        // Too big for this node now: free the staged chain and go the long way.
        free_cell_overflow(pager, &new_cell)?;
        self.delete(pager, target)?;
        self.insert(pager, target, payload)
    }

    pub fn range(
        &self,
        pager: &mut Pager,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
        ascending: bool,
    ) -> Result<RangeScan> {
        let (start, idx) = if ascending {
            let leaf_no = descend_to_leaf(pager, self.root, lo, true)?;
            let leaf = pager.read_page(leaf_no)?;
            let idx = match lo {
                Some(bound) => search_leaf(&leaf, bound)?.0,
                None => 0,
            };
            (leaf_no, idx as isize)
        } else {
            let leaf_no = descend_to_leaf(pager, self.root, hi, false)?;
            let leaf = pager.read_page(leaf_no)?;
            let idx = match hi {
                Some(bound) => {
                    // Last cell at or below the bound.
                    let (pos, exact) = search_leaf(&leaf, bound)?;
                    if exact {
                        pos as isize
                    } else {
                        pos as isize - 1
                    }
                }
                None => slot_count(&leaf) as isize - 1,
            };
            (leaf_no, idx)
        };
        Ok(RangeScan {
            current: start,
            idx,
            lo: lo.map(|b| b.to_vec()),
            hi: hi.map(|b| b.to_vec()),
            ascending,
            done: false,
        })
    }

    /// Frees every page of the tree, overflow chains included.
    pub fn free(&self, pager: &mut Pager) -> Result<()> {
        free_subtree(pager, self.root)
    }

    /// Walks the whole tree verifying structural invariants; returns basic
    /// shape statistics. Used by tests and consistency checks.
    pub fn check(&self, pager: &mut Pager) -> Result<TreeStats> {
        let mut stats = TreeStats {
            depth: 0,
            entries: 0,
            pages: 0,
        };
        check_rec(pager, self.root, None, None, true, 1, &mut stats)?;
        Ok(stats)
    }

    fn grow_root(&self, pager: &mut Pager, split: Split) -> Result<()> {
        let root = pager.read_page(self.root)?;
        let root_kind = root.kind()?;
        let left_no = pager.allocate_page(root_kind)?;
        let mut left = root.clone();
        left.no = left_no;
        pager.write_page(left)?;

        if root_kind == PageKind::BTreeLeaf {
            // The right half still points back at the root page number.
            let mut right = pager.read_page(split.right)?;
            if leaf_prev(&right) == self.root {
                set_leaf_prev(&mut right, left_no);
                pager.write_page(right)?;
            }
        }

        let mut new_root = Page::new(self.root, PageKind::BTreeInternal);
        init_internal(&mut new_root);
        let cell = make_internal_cell(&split.sep, left_no);
        let ok = insert_cell(&mut new_root, 0, &cell);
        debug_assert!(ok);
        set_rightmost(&mut new_root, split.right);
        pager.write_page(new_root)?;
        Ok(())
    }

    fn collapse_root(&self, pager: &mut Pager) -> Result<()> {
        loop {
            let root = pager.read_page(self.root)?;
            if root.kind()? != PageKind::BTreeInternal || slot_count(&root) != 0 {
                return Ok(());
            }
            let child_no = rightmost(&root);
            let child = pager.read_page(child_no)?;
            let mut promoted = child.clone();
            promoted.no = self.root;
            pager.write_page(promoted)?;
            pager.free_page(child_no)?;
        }
    }
}

/// Forward or backward walk over leaf cells within inclusive bounds.
pub struct RangeScan {
    current: PageNo,
    idx: isize,
    lo: Option<Vec<u8>>,
    hi: Option<Vec<u8>>,
    ascending: bool,
    done: bool,
}

impl RangeScan {
    /// Yields the next `(encoded key, payload)` pair, or `None` at the end.
    pub fn next_entry(&mut self, pager: &mut Pager) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.done {
            return Ok(None);
        }
        loop {
            let page = pager.read_page(self.current)?;
            page.expect_kind(PageKind::BTreeLeaf)?;
            let count = slot_count(&page) as isize;

            if self.ascending && self.idx >= count {
                let next = leaf_next(&page);
                if next == NO_PAGE {
                    self.done = true;
                    return Ok(None);
                }
                self.current = next;
                self.idx = 0;
                continue;
            }
            if !self.ascending && self.idx < 0 {
                let prev = leaf_prev(&page);
                if prev == NO_PAGE {
                    self.done = true;
                    return Ok(None);
                }
                let prev_page = pager.read_page(prev)?;
                self.current = prev;
                self.idx = slot_count(&prev_page) as isize - 1;
                continue;
            }

            let cell = cell_bytes(&page, self.idx as usize).to_vec();
            let cell_key = leaf_cell_key(&cell).to_vec();
            if self.ascending {
                if let Some(hi) = &self.hi {
                    if key::compare_encoded(&cell_key, hi)? == Ordering::Greater {
                        self.done = true;
                        return Ok(None);
                    }
                }
                self.idx += 1;
            } else {
                if let Some(lo) = &self.lo {
                    if key::compare_encoded(&cell_key, lo)? == Ordering::Less {
                        self.done = true;
                        return Ok(None);
                    }
                }
                self.idx -= 1;
            }
            let payload = read_leaf_payload(pager, &cell)?;
            return Ok(Some((cell_key, payload)));
        }
    }
}

// ---- node layout helpers ----

fn header_bytes(page: &Page) -> usize {
    match PageKind::from_tag(page.data[0]) {
        Some(PageKind::BTreeLeaf) => LEAF_HEADER_BYTES,
        _ => INTERNAL_HEADER_BYTES,
    }
}

fn init_leaf(page: &mut Page) {
    page.set_kind(PageKind::BTreeLeaf);
    page.write_u16(SLOT_COUNT_OFFSET, 0);
    page.write_u16(CELL_START_OFFSET, PAGE_SIZE as u16);
    page.write_u32(LEAF_PREV_OFFSET, NO_PAGE);
    page.write_u32(LEAF_NEXT_OFFSET, NO_PAGE);
}

fn init_internal(page: &mut Page) {
    page.set_kind(PageKind::BTreeInternal);
    page.write_u16(SLOT_COUNT_OFFSET, 0);
    page.write_u16(CELL_START_OFFSET, PAGE_SIZE as u16);
    page.write_u32(RIGHTMOST_OFFSET, NO_PAGE);
}

fn slot_count(page: &Page) -> usize {
    page.read_u16(SLOT_COUNT_OFFSET) as usize
}

fn cell_start(page: &Page) -> usize {
    page.read_u16(CELL_START_OFFSET) as usize
}

fn leaf_prev(page: &Page) -> PageNo {
    page.read_u32(LEAF_PREV_OFFSET)
}

fn set_leaf_prev(page: &mut Page, no: PageNo) {
    page.write_u32(LEAF_PREV_OFFSET, no);
}

fn leaf_next(page: &Page) -> PageNo {
    page.read_u32(LEAF_NEXT_OFFSET)
}

fn set_leaf_next(page: &mut Page, no: PageNo) {
    page.write_u32(LEAF_NEXT_OFFSET, no);
}

fn rightmost(page: &Page) -> PageNo {
    page.read_u32(RIGHTMOST_OFFSET)
}

fn set_rightmost(page: &mut Page, no: PageNo) {
    page.write_u32(RIGHTMOST_OFFSET, no);
}

fn slot(page: &Page, idx: usize) -> (usize, usize) {
    let at = header_bytes(page) + idx * SLOT_BYTES;
    (page.read_u16(at) as usize, page.read_u16(at + 2) as usize)
}

fn set_slot(page: &mut Page, idx: usize, offset: usize, len: usize) {
    let at = header_bytes(page) + idx * SLOT_BYTES;
    page.write_u16(at, offset as u16);
    page.write_u16(at + 2, len as u16);
}

fn cell_bytes(page: &Page, idx: usize) -> &[u8] {
    let (offset, len) = slot(page, idx);
    &page.data[offset..offset + len]
}

fn capacity(page: &Page) -> usize {
    PAGE_SIZE - header_bytes(page)
}

fn used_space(page: &Page) -> usize {
    (PAGE_SIZE - cell_start(page)) + slot_count(page) * SLOT_BYTES
}

fn free_space(page: &Page) -> usize {
    let dir_end = header_bytes(page) + slot_count(page) * SLOT_BYTES;
    cell_start(page).saturating_sub(dir_end)
}

// Variable-length cells make an entry-count minimum meaningless; an eighth
// of the cell capacity is the byte-occupancy bound rebalancing restores.
fn is_underfull(page: &Page) -> bool {
    used_space(page) * 8 < capacity(page)
}

fn insert_cell(page: &mut Page, idx: usize, cell: &[u8]) -> bool {
    let count = slot_count(page);
    debug_assert!(idx <= count);
    if free_space(page) < cell.len() + SLOT_BYTES {
        return false;
    }
    let offset = cell_start(page) - cell.len();
    page.data[offset..offset + cell.len()].copy_from_slice(cell);
    page.write_u16(CELL_START_OFFSET, offset as u16);

    for i in (idx..count).rev() {
        let (o, l) = slot(page, i);
        set_slot(page, i + 1, o, l);
    }
    set_slot(page, idx, offset, cell.len());
    page.write_u16(SLOT_COUNT_OFFSET, (count + 1) as u16);
    true
}

/// Removes a cell and compacts the heap so free space stays contiguous.
fn remove_cell(page: &mut Page, idx: usize) {
    let count = slot_count(page);
    debug_assert!(idx < count);
    let (gone_offset, gone_len) = slot(page, idx);
    let start = cell_start(page);

    // Slide everything below the removed cell up over it.
    page.data.copy_within(start..gone_offset, start + gone_len);
    page.write_u16(CELL_START_OFFSET, (start + gone_len) as u16);

    for i in idx..count - 1 {
        let (o, l) = slot(page, i + 1);
        set_slot(page, i, o, l);
    }
    page.write_u16(SLOT_COUNT_OFFSET, (count - 1) as u16);

    let new_count = count - 1;
    for i in 0..new_count {
        let (o, l) = slot(page, i);
        if o < gone_offset {
            set_slot(page, i, o + gone_len, l);
        }
    }
}

fn read_cells(page: &Page) -> Vec<Vec<u8>> {
    (0..slot_count(page))
        .map(|i| cell_bytes(page, i).to_vec())
        .collect()
}

/// Re-lays a node out from scratch, preserving header extras.
fn rebuild(page: &mut Page, cells: &[Vec<u8>]) {
    page.write_u16(SLOT_COUNT_OFFSET, 0);
    page.write_u16(CELL_START_OFFSET, PAGE_SIZE as u16);
    for (i, cell) in cells.iter().enumerate() {
        let ok = insert_cell(page, i, cell);
        debug_assert!(ok, "rebuild cells must fit");
    }
}

// ---- cell formats ----

fn leaf_cell_key(cell: &[u8]) -> &[u8] {
    let klen = u16::from_le_bytes([cell[0], cell[1]]) as usize;
    &cell[2..2 + klen]
}

fn leaf_cell_payload(cell: &[u8]) -> (u8, &[u8]) {
    let klen = u16::from_le_bytes([cell[0], cell[1]]) as usize;
    (cell[2 + klen], &cell[2 + klen + 1..])
}

/// Builds a leaf cell, spilling oversized payloads to an overflow chain.
fn build_leaf_cell(pager: &mut Pager, target: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
    let mut cell = Vec::with_capacity(2 + target.len() + 1 + payload.len().min(MAX_INLINE_PAYLOAD));
    cell.extend_from_slice(&(target.len() as u16).to_le_bytes());
    cell.extend_from_slice(target);
    if payload.len() <= MAX_INLINE_PAYLOAD {
        cell.push(PAYLOAD_INLINE);
        cell.extend_from_slice(payload);
    } else {
        let first = pager.write_chain(PageKind::Overflow, payload)?;
        cell.push(PAYLOAD_OVERFLOW);
        cell.extend_from_slice(&first.to_le_bytes());
        cell.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    }
    Ok(cell)
}

fn read_leaf_payload(pager: &mut Pager, cell: &[u8]) -> Result<Vec<u8>> {
    let (flag, body) = leaf_cell_payload(cell);
    match flag {
        PAYLOAD_INLINE => Ok(body.to_vec()),
        PAYLOAD_OVERFLOW => {
            if body.len() != 8 {
                return Err(Error::Corruption("overflow cell body malformed".into()));
            }
            let first = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
            let total = u32::from_le_bytes([body[4], body[5], body[6], body[7]]) as usize;
            let bytes = pager.read_chain(PageKind::Overflow, first)?;
            if bytes.len() != total {
                return Err(Error::Corruption(format!(
                    "overflow chain holds {} bytes, cell expects {total}",
                    bytes.len()
                )));
            }
            Ok(bytes)
        }
        other => Err(Error::Corruption(format!(
            "unknown payload flag 0x{other:02x}"
        ))),
    }
}

fn free_cell_overflow(pager: &mut Pager, cell: &[u8]) -> Result<()> {
    let (flag, body) = leaf_cell_payload(cell);
    if flag == PAYLOAD_OVERFLOW && body.len() == 8 {
        let first = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
        pager.free_chain(PageKind::Overflow, first)?;
    }
    Ok(())
}

fn make_internal_cell(target: &[u8], child: PageNo) -> Vec<u8> {
    let mut cell = Vec::with_capacity(2 + target.len() + 4);
    cell.extend_from_slice(&(target.len() as u16).to_le_bytes());
    cell.extend_from_slice(target);
    cell.extend_from_slice(&child.to_le_bytes());
    cell
}

fn internal_cell_key(cell: &[u8]) -> &[u8] {
    let klen = u16::from_le_bytes([cell[0], cell[1]]) as usize;
    &cell[2..2 + klen]
}

fn internal_cell_child(cell: &[u8]) -> PageNo {
    let klen = u16::from_le_bytes([cell[0], cell[1]]) as usize;
    let at = 2 + klen;
    u32::from_le_bytes([cell[at], cell[at + 1], cell[at + 2], cell[at + 3]])
}

// ---- search ----

/// First slot whose key is >= target, plus whether it matches exactly.
fn search_leaf(page: &Page, target: &[u8]) -> Result<(usize, bool)> {
    let count = slot_count(page);
    let mut lo = 0;
    let mut hi = count;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let cell_key = leaf_cell_key(cell_bytes(page, mid));
        if key::compare_encoded(cell_key, target)? == Ordering::Less {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    if lo < count {
        let cell_key = leaf_cell_key(cell_bytes(page, lo));
        Ok((lo, key::compare_encoded(cell_key, target)? == Ordering::Equal))
    } else {
        Ok((lo, false))
    }
}

/// Which child of an internal node covers the target: the first cell whose
/// key exceeds it, or the rightmost child.
fn child_pos(page: &Page, target: &[u8]) -> Result<usize> {
    let count = slot_count(page);
    let mut lo = 0;
    let mut hi = count;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let cell_key = internal_cell_key(cell_bytes(page, mid));
        if key::compare_encoded(target, cell_key)? == Ordering::Less {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    Ok(lo)
}

fn child_at(page: &Page, pos: usize) -> PageNo {
    if pos < slot_count(page) {
        internal_cell_child(cell_bytes(page, pos))
    } else {
        rightmost(page)
    }
}

/// Descends to the leaf that would hold `target`. With no target, takes the
/// first child (`leftward`) or the rightmost child throughout.
fn descend_to_leaf(
    pager: &mut Pager,
    root: PageNo,
    target: Option<&[u8]>,
    leftward: bool,
) -> Result<PageNo> {
    let mut current = root;
    loop {
        let page = pager.read_page(current)?;
        match page.kind()? {
            PageKind::BTreeLeaf => return Ok(current),
            PageKind::BTreeInternal => {
                let pos = match target {
                    Some(t) => child_pos(&page, t)?,
                    None if leftward => 0,
                    None => slot_count(&page),
                };
                current = child_at(&page, pos);
            }
            other => {
                return Err(Error::Corruption(format!(
                    "page {current} is {other:?}, expected a B-tree node"
                )))
            }
        }
    }
}

// ---- insert ----

fn insert_rec(
    pager: &mut Pager,
    page_no: PageNo,
    target: &[u8],
    payload: &[u8],
) -> Result<Option<Split>> {
    let page = pager.read_page(page_no)?;
    match page.kind()? {
        PageKind::BTreeLeaf => insert_into_leaf(pager, page, target, payload),
        PageKind::BTreeInternal => {
            let pos = child_pos(&page, target)?;
            let child_no = child_at(&page, pos);
            let Some(split) = insert_rec(pager, child_no, target, payload)? else {
                return Ok(None);
            };
            // The child handed up a separator: the old slot keeps its upper
            // bound but now points at the new right half, and a fresh cell
            // binds the left half below the separator.
            let mut page = pager.read_page(page_no)?;
            if pos < slot_count(&page) {
                let old = cell_bytes(&page, pos).to_vec();
                let replacement = make_internal_cell(internal_cell_key(&old), split.right);
                remove_cell(&mut page, pos);
                let ok = insert_cell(&mut page, pos, &replacement);
                debug_assert!(ok);
            } else {
                set_rightmost(&mut page, split.right);
            }
            let sep_cell = make_internal_cell(&split.sep, child_no);
            if insert_cell(&mut page, pos, &sep_cell) {
                pager.write_page(page)?;
                return Ok(None);
            }
            split_internal(pager, page, pos, &sep_cell)
        }
        other => Err(Error::Corruption(format!(
            "page {page_no} is {other:?}, expected a B-tree node"
        ))),
    }
}

fn insert_into_leaf(
    pager: &mut Pager,
    mut page: Page,
    target: &[u8],
    payload: &[u8],
) -> Result<Option<Split>> {
    let (idx, exact) = search_leaf(&page, target)?;
    if exact {
        return Err(Error::DuplicateKey("key already exists".into()));
    }
    let cell = build_leaf_cell(pager, target, payload)?;
    if insert_cell(&mut page, idx, &cell) {
        pager.write_page(page)?;
        return Ok(None);
    }

    // Split at the byte midpoint of the would-be cell sequence.
    let mut cells = read_cells(&page);
    cells.insert(idx, cell);
    let total: usize = cells.iter().map(|c| c.len() + SLOT_BYTES).sum();
    let mut left_cells = Vec::new();
    let mut right_cells = Vec::new();
    let mut acc = 0usize;
    for cell in cells {
        if acc < total / 2 || left_cells.is_empty() {
            acc += cell.len() + SLOT_BYTES;
            left_cells.push(cell);
        } else {
            right_cells.push(cell);
        }
    }
    if right_cells.is_empty() {
        // Degenerate but possible with one giant trailing cell.
        right_cells.push(left_cells.pop().ok_or_else(|| {
            Error::Corruption("leaf split produced no cells".into())
        })?);
    }

    let right_no = pager.allocate_page(PageKind::BTreeLeaf)?;
    let mut right = Page::new(right_no, PageKind::BTreeLeaf);
    init_leaf(&mut right);
    rebuild(&mut right, &right_cells);
    set_leaf_prev(&mut right, page.no);
    set_leaf_next(&mut right, leaf_next(&page));

    let old_next = leaf_next(&page);
    if old_next != NO_PAGE {
        let mut neighbor = pager.read_page(old_next)?;
        set_leaf_prev(&mut neighbor, right_no);
        pager.write_page(neighbor)?;
    }

    rebuild(&mut page, &left_cells);
    set_leaf_next(&mut page, right_no);

    let sep = leaf_cell_key(&right_cells[0]).to_vec();
    pager.write_page(page)?;
    pager.write_page(right)?;
    Ok(Some(Split { sep, right: right_no }))
}

/// Splits an internal node that could not absorb `sep_cell` at `pos`.
fn split_internal(
    pager: &mut Pager,
    mut page: Page,
    pos: usize,
    sep_cell: &[u8],
) -> Result<Option<Split>> {
    let mut cells = read_cells(&page);
    cells.insert(pos, sep_cell.to_vec());
    let old_rightmost = rightmost(&page);

    let total: usize = cells.iter().map(|c| c.len() + SLOT_BYTES).sum();
    let mut acc = 0usize;
    let mut median = 0usize;
    for (i, cell) in cells.iter().enumerate() {
        acc += cell.len() + SLOT_BYTES;
        if acc >= total / 2 {
            median = i;
            break;
        }
    }
    // The median needs a left and a right side.
    median = median.clamp(0, cells.len().saturating_sub(2));
    if cells.len() < 3 {
        return Err(Error::Corruption(
            "internal node too small to split".into(),
        ));
    }

    let right_cells: Vec<Vec<u8>> = cells.split_off(median + 1);
    let median_cell = cells.pop().ok_or_else(|| {
        Error::Corruption("internal split lost its median".into())
    })?;
    let promoted = internal_cell_key(&median_cell).to_vec();
    let median_child = internal_cell_child(&median_cell);

    let right_no = pager.allocate_page(PageKind::BTreeInternal)?;
    let mut right = Page::new(right_no, PageKind::BTreeInternal);
    init_internal(&mut right);
    rebuild(&mut right, &right_cells);
    set_rightmost(&mut right, old_rightmost);

    rebuild(&mut page, &cells);
    set_rightmost(&mut page, median_child);

    pager.write_page(page)?;
    pager.write_page(right)?;
    Ok(Some(Split {
        sep: promoted,
        right: right_no,
    }))
}

// ---- delete ----

fn delete_rec(pager: &mut Pager, page_no: PageNo, target: &[u8]) -> Result<()> {
    let page = pager.read_page(page_no)?;
    match page.kind()? {
        PageKind::BTreeLeaf => {
            let mut page = page;
            let (idx, exact) = search_leaf(&page, target)?;
            if !exact {
                return Err(Error::NotFound("key not found".into()));
            }
            let cell = cell_bytes(&page, idx).to_vec();
            free_cell_overflow(pager, &cell)?;
            remove_cell(&mut page, idx);
            pager.write_page(page)?;
            Ok(())
        }
        PageKind::BTreeInternal => {
            let pos = child_pos(&page, target)?;
            let child_no = child_at(&page, pos);
            delete_rec(pager, child_no, target)?;
            rebalance_child(pager, page_no, pos)
        }
        other => Err(Error::Corruption(format!(
            "page {page_no} is {other:?}, expected a B-tree node"
        ))),
    }
}

/// Restores the minimum-fill bound of the child at `pos` by borrowing from a
/// sibling, or merging with one when borrowing cannot help.
fn rebalance_child(pager: &mut Pager, parent_no: PageNo, pos: usize) -> Result<()> {
    loop {
        let parent = pager.read_page(parent_no)?;
        let child_no = child_at(&parent, pos);
        let child = pager.read_page(child_no)?;
        if !is_underfull(&child) {
            return Ok(());
        }
        let n = slot_count(&parent);
        if pos > 0 && borrow_one(pager, parent_no, pos - 1, true)? {
            continue;
        }
        if pos < n && borrow_one(pager, parent_no, pos, false)? {
            continue;
        }
        if pos < n && merge_children(pager, parent_no, pos)? {
            return Ok(());
        }
        if pos > 0 && merge_children(pager, parent_no, pos - 1)? {
            return Ok(());
        }
        // Neither sibling can lend or absorb; accept the underflow.
        return Ok(());
    }
}

/// Moves one boundary cell across the separator at `sep_pos`. With
/// `left_to_right`, the donor is the left child of the separator cell;
/// otherwise the right one donates its first cell leftward.
fn borrow_one(
    pager: &mut Pager,
    parent_no: PageNo,
    sep_pos: usize,
    left_to_right: bool,
) -> Result<bool> {
    let mut parent = pager.read_page(parent_no)?;
    let sep_cell = cell_bytes(&parent, sep_pos).to_vec();
    let left_no = internal_cell_child(&sep_cell);
    let right_no = child_at(&parent, sep_pos + 1);
    let mut left = pager.read_page(left_no)?;
    let mut right = pager.read_page(right_no)?;

    let (donor, receiver) = if left_to_right {
        (&mut left, &mut right)
    } else {
        (&mut right, &mut left)
    };
    let donor_count = slot_count(donor);
    if donor_count == 0 {
        return Ok(false);
    }
    let donor_idx = if left_to_right { donor_count - 1 } else { 0 };
    let moved = cell_bytes(donor, donor_idx).to_vec();
    if used_space(donor) < moved.len() + SLOT_BYTES
        || (used_space(donor) - moved.len() - SLOT_BYTES) * 8 < capacity(donor)
    {
        return Ok(false);
    }

    let is_leaf = donor.kind()? == PageKind::BTreeLeaf;
    let (moved_for_receiver, new_sep) = if is_leaf {
        let new_sep = if left_to_right {
            // The moved cell becomes the right node's first key.
            leaf_cell_key(&moved).to_vec()
        } else {
            // The right node's next-first key becomes the separator.
            if donor_count < 2 {
                return Ok(false);
            }
            leaf_cell_key(cell_bytes(donor, 1)).to_vec()
        };
        (moved.clone(), new_sep)
    } else {
        // Rotate through the parent separator.
        let sep_key = internal_cell_key(&sep_cell).to_vec();
        let moved_key = internal_cell_key(&moved).to_vec();
        let moved_child = internal_cell_child(&moved);
        if left_to_right {
            // Left's rightmost child crosses over, bounded by the old separator.
            let crossing = rightmost(donor);
            set_rightmost(donor, moved_child);
            (make_internal_cell(&sep_key, crossing), moved_key)
        } else {
            // Right's first cell child crosses over to become left's rightmost.
            let receiver_rightmost = rightmost(receiver);
            set_rightmost(receiver, moved_child);
            (make_internal_cell(&sep_key, receiver_rightmost), moved_key)
        }
    };

    // The parent swaps separator keys; make sure the new one fits.
    let new_sep_cell = make_internal_cell(&new_sep, left_no);
    let parent_room =
        free_space(&parent) + sep_cell.len() + SLOT_BYTES;
    if new_sep_cell.len() + SLOT_BYTES > parent_room {
        return Ok(false);
    }

    let receiver_idx = if left_to_right { 0 } else { slot_count(receiver) };
    remove_cell(donor, donor_idx);
    if !insert_cell(receiver, receiver_idx, &moved_for_receiver) {
        return Ok(false);
    }
    remove_cell(&mut parent, sep_pos);
    let ok = insert_cell(&mut parent, sep_pos, &new_sep_cell);
    debug_assert!(ok);

    pager.write_page(left)?;
    pager.write_page(right)?;
    pager.write_page(parent)?;
    Ok(true)
}

/// Merges the children on both sides of the separator at `sep_pos` into the
/// left one, if the result fits on a page.
fn merge_children(pager: &mut Pager, parent_no: PageNo, sep_pos: usize) -> Result<bool> {
    let mut parent = pager.read_page(parent_no)?;
    let sep_cell = cell_bytes(&parent, sep_pos).to_vec();
    let left_no = internal_cell_child(&sep_cell);
    let right_no = child_at(&parent, sep_pos + 1);
    let mut left = pager.read_page(left_no)?;
    let right = pager.read_page(right_no)?;

    let is_leaf = left.kind()? == PageKind::BTreeLeaf;
    let pulled_down = if is_leaf {
        None
    } else {
        Some(make_internal_cell(
            internal_cell_key(&sep_cell),
            rightmost(&left),
        ))
    };
    let extra = pulled_down.as_ref().map(|c| c.len() + SLOT_BYTES).unwrap_or(0);
    if used_space(&left) + used_space(&right) + extra > capacity(&left) {
        return Ok(false);
    }

    let mut combined = read_cells(&left);
    if let Some(cell) = pulled_down {
        combined.push(cell);
    }
    combined.extend(read_cells(&right));
    rebuild(&mut left, &combined);

    if is_leaf {
        let new_next = leaf_next(&right);
        set_leaf_next(&mut left, new_next);
        if new_next != NO_PAGE {
            let mut neighbor = pager.read_page(new_next)?;
            set_leaf_prev(&mut neighbor, left_no);
            pager.write_page(neighbor)?;
        }
    } else {
        set_rightmost(&mut left, rightmost(&right));
    }

    // Drop the separator; whatever pointed at the right child now points at
    // the merged left one.
    remove_cell(&mut parent, sep_pos);
    if sep_pos < slot_count(&parent) {
        let shifted = cell_bytes(&parent, sep_pos).to_vec();
        let fixed = make_internal_cell(internal_cell_key(&shifted), left_no);
        remove_cell(&mut parent, sep_pos);
        let ok = insert_cell(&mut parent, sep_pos, &fixed);
        debug_assert!(ok);
    } else {
        set_rightmost(&mut parent, left_no);
    }

    pager.write_page(left)?;
    pager.write_page(parent)?;
    pager.free_page(right_no)?;
    Ok(true)
}

// ---- maintenance walks ----

fn free_subtree(pager: &mut Pager, page_no: PageNo) -> Result<()> {
    let page = pager.read_page(page_no)?;
    match page.kind()? {
        PageKind::BTreeLeaf => {
            for idx in 0..slot_count(&page) {
                let cell = cell_bytes(&page, idx).to_vec();
                free_cell_overflow(pager, &cell)?;
            }
        }
        PageKind::BTreeInternal => {
            for idx in 0..slot_count(&page) {
                let child = internal_cell_child(cell_bytes(&page, idx));
                free_subtree(pager, child)?;
            }
            free_subtree(pager, rightmost(&page))?;
        }
        other => {
            return Err(Error::Corruption(format!(
                "page {page_no} is {other:?}, expected a B-tree node"
            )))
        }
    }
    pager.free_page(page_no)?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn check_rec(
    pager: &mut Pager,
    page_no: PageNo,
    lower: Option<&[u8]>,
    upper: Option<&[u8]>,
    is_root: bool,
    depth: usize,
    stats: &mut TreeStats,
) -> Result<usize> {
    let page = pager.read_page(page_no)?;
    stats.pages += 1;

    let check_bounds = |key_bytes: &[u8]| -> Result<()> {
        if let Some(lower) = lower {
            if key::compare_encoded(key_bytes, lower)? == Ordering::Less {
                return Err(Error::Corruption(format!(
                    "page {page_no}: key below subtree lower bound"
                )));
            }
        }
        if let Some(upper) = upper {
            if key::compare_encoded(key_bytes, upper)? != Ordering::Less {
                return Err(Error::Corruption(format!(
                    "page {page_no}: key at or above subtree upper bound"
                )));
            }
        }
        Ok(())
    };

    if !is_root && is_underfull(&page) {
        return Err(Error::Corruption(format!(
            "page {page_no}: node below minimum fill"
        )));
    }

    match page.kind()? {
        PageKind::BTreeLeaf => {
            let count = slot_count(&page);
            for idx in 0..count {
                let key_bytes = leaf_cell_key(cell_bytes(&page, idx));
                check_bounds(key_bytes)?;
                if idx + 1 < count {
                    let next_key = leaf_cell_key(cell_bytes(&page, idx + 1));
                    if key::compare_encoded(key_bytes, next_key)? != Ordering::Less {
                        return Err(Error::Corruption(format!(
                            "page {page_no}: leaf keys out of order"
                        )));
                    }
                }
            }
            stats.entries += count as u64;
            if depth > stats.depth {
                stats.depth = depth;
            }
            Ok(depth)
        }
        PageKind::BTreeInternal => {
            let count = slot_count(&page);
            if rightmost(&page) == NO_PAGE {
                return Err(Error::Corruption(format!(
                    "page {page_no}: internal node lacks a rightmost child"
                )));
            }
            let mut child_lower = lower.map(|b| b.to_vec());
            let mut depths = Vec::with_capacity(count + 1);
            for idx in 0..count {
                let cell = cell_bytes(&page, idx).to_vec();
                let sep = internal_cell_key(&cell);
                check_bounds(sep)?;
                if idx + 1 < count {
                    let next_sep = internal_cell_key(cell_bytes(&page, idx + 1));
                    if key::compare_encoded(sep, next_sep)? != Ordering::Less {
                        return Err(Error::Corruption(format!(
                            "page {page_no}: separators out of order"
                        )));
                    }
                }
                let child = internal_cell_child(&cell);
                depths.push(check_rec(
                    pager,
                    child,
                    child_lower.as_deref(),
                    Some(sep),
                    false,
                    depth + 1,
                    stats,
                )?);
                child_lower = Some(sep.to_vec());
            }
            depths.push(check_rec(
                pager,
                rightmost(&page),
                child_lower.as_deref(),
                upper,
                false,
                depth + 1,
                stats,
            )?);
            let first = depths[0];
            if depths.iter().any(|d| *d != first) {
                return Err(Error::Corruption(format!(
                    "page {page_no}: leaves at unequal depths"
                )));
            }
            Ok(first)
        }
        other => Err(Error::Corruption(format!(
            "page {page_no} is {other:?}, expected a B-tree node"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use tempfile::tempdir;

    fn open_pager(dir: &tempfile::TempDir) -> Pager {
        Pager::open(dir.path().join("tree.db")).unwrap()
    }

    fn int_key(v: i64) -> Vec<u8> {
        key::encode_key(&[Value::Integer(v)])
    }

    fn row(v: i64) -> Vec<u8> {
        crate::record::encode_row(&[Value::Integer(v), Value::Text(format!("row-{v}"))])
    }

    #[test]
    fn insert_and_find_single_leaf() {
        let dir = tempdir().unwrap();
        let mut pager = open_pager(&dir);
        pager.begin().unwrap();
        let tree = BTree::create(&mut pager).unwrap();
        for v in [5, 1, 3] {
            tree.insert(&mut pager, &int_key(v), &row(v)).unwrap();
        }
        assert_eq!(tree.find(&mut pager, &int_key(3)).unwrap(), Some(row(3)));
        assert_eq!(tree.find(&mut pager, &int_key(4)).unwrap(), None);
        pager.commit().unwrap();
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let dir = tempdir().unwrap();
        let mut pager = open_pager(&dir);
        pager.begin().unwrap();
        let tree = BTree::create(&mut pager).unwrap();
        tree.insert(&mut pager, &int_key(1), &row(1)).unwrap();
        assert!(matches!(
            tree.insert(&mut pager, &int_key(1), &row(1)),
            Err(Error::DuplicateKey(_))
        ));
        pager.commit().unwrap();
    }

    #[test]
    fn splits_keep_the_tree_ordered_and_balanced() {
        let dir = tempdir().unwrap();
        let mut pager = open_pager(&dir);
        pager.begin().unwrap();
        let tree = BTree::create(&mut pager).unwrap();
        for v in 0..2000 {
            tree.insert(&mut pager, &int_key(v), &row(v)).unwrap();
        }
        let stats = tree.check(&mut pager).unwrap();
        assert_eq!(stats.entries, 2000);
        assert!(stats.depth > 1, "2000 rows should split the root");
        for v in [0, 999, 1999] {
            assert_eq!(tree.find(&mut pager, &int_key(v)).unwrap(), Some(row(v)));
        }
        pager.commit().unwrap();
    }

    #[test]
    fn reverse_insertion_order_scans_sorted() {
        let dir = tempdir().unwrap();
        let mut pager = open_pager(&dir);
        pager.begin().unwrap();
        let tree = BTree::create(&mut pager).unwrap();
        for v in (0..500).rev() {
            tree.insert(&mut pager, &int_key(v), &row(v)).unwrap();
        }
        let mut scan = tree.range(&mut pager, None, None, true).unwrap();
        let mut seen = Vec::new();
        while let Some((k, _)) = scan.next_entry(&mut pager).unwrap() {
            let decoded = key::decode_key(&k).unwrap();
            if let Value::Integer(v) = decoded[0] {
                seen.push(v);
            }
        }
        assert_eq!(seen, (0..500).collect::<Vec<_>>());
        pager.commit().unwrap();
    }

    #[test]
    fn range_bounds_are_inclusive() {
        let dir = tempdir().unwrap();
        let mut pager = open_pager(&dir);
        pager.begin().unwrap();
        let tree = BTree::create(&mut pager).unwrap();
        for v in 0..100 {
            tree.insert(&mut pager, &int_key(v), &row(v)).unwrap();
        }
        let lo = int_key(10);
        let hi = int_key(20);
        let mut scan = tree
            .range(&mut pager, Some(&lo), Some(&hi), true)
            .unwrap();
        let mut seen = Vec::new();
        while let Some((k, _)) = scan.next_entry(&mut pager).unwrap() {
            if let Value::Integer(v) = key::decode_key(&k).unwrap()[0] {
                seen.push(v);
            }
        }
        assert_eq!(seen, (10..=20).collect::<Vec<_>>());
        pager.commit().unwrap();
    }

    #[test]
    fn descending_scan_walks_left_pointers() {
        let dir = tempdir().unwrap();
        let mut pager = open_pager(&dir);
        pager.begin().unwrap();
        let tree = BTree::create(&mut pager).unwrap();
        for v in 0..1000 {
            tree.insert(&mut pager, &int_key(v), &row(v)).unwrap();
        }
        let lo = int_key(5);
        let hi = int_key(995);
        let mut scan = tree
            .range(&mut pager, Some(&lo), Some(&hi), false)
            .unwrap();
        let mut seen = Vec::new();
        while let Some((k, _)) = scan.next_entry(&mut pager).unwrap() {
            if let Value::Integer(v) = key::decode_key(&k).unwrap()[0] {
                seen.push(v);
            }
        }
        assert_eq!(seen, (5..=995).rev().collect::<Vec<_>>());
        pager.commit().unwrap();
    }

    #[test]
    fn delete_rebalances_and_preserves_order() {
        let dir = tempdir().unwrap();
        let mut pager = open_pager(&dir);
        pager.begin().unwrap();
        let tree = BTree::create(&mut pager).unwrap();
        for v in 0..3000 {
            tree.insert(&mut pager, &int_key(v), &row(v)).unwrap();
        }
        for v in (0..3000).filter(|v| v % 3 == 0) {
            tree.delete(&mut pager, &int_key(v)).unwrap();
        }
        let stats = tree.check(&mut pager).unwrap();
        assert_eq!(stats.entries, 2000);
        assert_eq!(tree.find(&mut pager, &int_key(3)).unwrap(), None);
        assert_eq!(tree.find(&mut pager, &int_key(4)).unwrap(), Some(row(4)));
        pager.commit().unwrap();
    }

    #[test]
    fn deleting_everything_collapses_back_to_one_leaf() {
        let dir = tempdir().unwrap();
        let mut pager = open_pager(&dir);
        pager.begin().unwrap();
        let tree = BTree::create(&mut pager).unwrap();
        for v in 0..1500 {
            tree.insert(&mut pager, &int_key(v), &row(v)).unwrap();
        }
        for v in 0..1500 {
            tree.delete(&mut pager, &int_key(v)).unwrap();
        }
        let stats = tree.check(&mut pager).unwrap();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.depth, 1);
        assert_eq!(stats.pages, 1);
        pager.commit().unwrap();
    }

    #[test]
    fn delete_missing_key_is_not_found() {
        let dir = tempdir().unwrap();
        let mut pager = open_pager(&dir);
        pager.begin().unwrap();
        let tree = BTree::create(&mut pager).unwrap();
        tree.insert(&mut pager, &int_key(1), &row(1)).unwrap();
        assert!(matches!(
            tree.delete(&mut pager, &int_key(2)),
            Err(Error::NotFound(_))
        ));
        pager.commit().unwrap();
    }

    #[test]
    fn update_in_place_and_with_resize() {
        let dir = tempdir().unwrap();
        let mut pager = open_pager(&dir);
        pager.begin().unwrap();
        let tree = BTree::create(&mut pager).unwrap();
        for v in 0..50 {
            tree.insert(&mut pager, &int_key(v), &row(v)).unwrap();
        }
        let same_size = row(7);
        tree.update(&mut pager, &int_key(7), &same_size).unwrap();
        let bigger = crate::record::encode_row(&[
            Value::Integer(7),
            Value::Text("x".repeat(900)),
        ]);
        tree.update(&mut pager, &int_key(7), &bigger).unwrap();
        assert_eq!(tree.find(&mut pager, &int_key(7)).unwrap(), Some(bigger));
        tree.check(&mut pager).unwrap();
        pager.commit().unwrap();
    }

    #[test]
    fn oversized_payloads_round_trip_through_overflow_chains() {
        let dir = tempdir().unwrap();
        let mut pager = open_pager(&dir);
        pager.begin().unwrap();
        let tree = BTree::create(&mut pager).unwrap();
        let big = crate::record::encode_row(&[
            Value::Integer(1),
            Value::Blob(vec![0x5A; PAGE_SIZE * 3]),
        ]);
        tree.insert(&mut pager, &int_key(1), &big).unwrap();
        assert_eq!(tree.find(&mut pager, &int_key(1)).unwrap(), Some(big));

        // Deleting must give the chain pages back.
        let pages_before_delete = pager.page_count();
        tree.delete(&mut pager, &int_key(1)).unwrap();
        let free = pager.free_list().unwrap();
        assert!(free.len() >= 3);
        assert_eq!(pager.page_count(), pages_before_delete);
        pager.commit().unwrap();
    }

    #[test]
    fn free_list_accounts_for_every_page_after_free() {
        let dir = tempdir().unwrap();
        let mut pager = open_pager(&dir);
        pager.begin().unwrap();
        let tree = BTree::create(&mut pager).unwrap();
        for v in 0..2000 {
            tree.insert(&mut pager, &int_key(v), &row(v)).unwrap();
        }
        let stats = tree.check(&mut pager).unwrap();
        tree.free(&mut pager).unwrap();
        let free = pager.free_list().unwrap();
        // header + freed tree pages = whole file
        assert_eq!(1 + free.len() as u32, pager.page_count());
        assert_eq!(stats.pages as usize, free.len());
        pager.commit().unwrap();
    }
}
