//! Object header encoding: type tags, collector colors and generational ages.

use bitflags::bitflags;
use std::fmt;

// ---- Type tags ----
//
// Bits 0-3 hold the basic type, bits 4-5 the variant, bit 6 marks
// collectable values.

pub const LUA_TNIL: u8 = 0;
pub const LUA_TBOOLEAN: u8 = 1;
pub const LUA_TLIGHTUSERDATA: u8 = 2;
pub const LUA_TNUMBER: u8 = 3;
pub const LUA_TSTRING: u8 = 4;
pub const LUA_TTABLE: u8 = 5;
pub const LUA_TFUNCTION: u8 = 6;
pub const LUA_TUSERDATA: u8 = 7;
pub const LUA_TTHREAD: u8 = 8;

/// Number of basic types visible to scripts (one metatable slot each).
pub const LUA_NUMTYPES: usize = 9;

/// Internal collectable types that never appear in a `TValue`.
pub const LUA_TUPVAL: u8 = LUA_NUMTYPES as u8;
pub const LUA_TPROTO: u8 = LUA_NUMTYPES as u8 + 1;

/// Build a variant tag from a basic type and a variant number.
#[inline]
pub const fn make_variant(t: u8, v: u8) -> u8 {
    t | (v << 4)
}

pub const LUA_VNIL: u8 = make_variant(LUA_TNIL, 0);
pub const LUA_VEMPTY: u8 = make_variant(LUA_TNIL, 1);
pub const LUA_VABSTKEY: u8 = make_variant(LUA_TNIL, 2);
pub const LUA_VFALSE: u8 = make_variant(LUA_TBOOLEAN, 0);
pub const LUA_VTRUE: u8 = make_variant(LUA_TBOOLEAN, 1);
pub const LUA_VLIGHTUSERDATA: u8 = make_variant(LUA_TLIGHTUSERDATA, 0);
pub const LUA_VNUMINT: u8 = make_variant(LUA_TNUMBER, 0);
pub const LUA_VNUMFLT: u8 = make_variant(LUA_TNUMBER, 1);
pub const LUA_VSHRSTR: u8 = make_variant(LUA_TSTRING, 0);
pub const LUA_VTABLE: u8 = make_variant(LUA_TTABLE, 0);
pub const LUA_VLCL: u8 = make_variant(LUA_TFUNCTION, 0);
pub const LUA_VLCF: u8 = make_variant(LUA_TFUNCTION, 1);
pub const LUA_VCCL: u8 = make_variant(LUA_TFUNCTION, 2);
pub const LUA_VUSERDATA: u8 = make_variant(LUA_TUSERDATA, 0);
pub const LUA_VTHREAD: u8 = make_variant(LUA_TTHREAD, 0);
pub const LUA_VUPVAL: u8 = make_variant(LUA_TUPVAL, 0);
pub const LUA_VPROTO: u8 = make_variant(LUA_TPROTO, 0);

pub const BIT_ISCOLLECTABLE: u8 = 1 << 6;

/// Mark a tag as collectable.
#[inline]
pub const fn ctb(tag: u8) -> u8 {
    tag | BIT_ISCOLLECTABLE
}

/// Basic type of a tag (variant and collectable bits dropped).
#[inline]
pub const fn novariant(tag: u8) -> u8 {
    tag & 0x0F
}

/// Tag with variant but without the collectable bit.
#[inline]
pub const fn with_variant(tag: u8) -> u8 {
    tag & 0x3F
}

/// Type name for a basic type, as scripts see it.
pub fn type_name(basic: u8) -> &'static str {
    match basic {
        LUA_TNIL => "nil",
        LUA_TBOOLEAN => "boolean",
        LUA_TLIGHTUSERDATA | LUA_TUSERDATA => "userdata",
        LUA_TNUMBER => "number",
        LUA_TSTRING => "string",
        LUA_TTABLE => "table",
        LUA_TFUNCTION => "function",
        LUA_TTHREAD => "thread",
        LUA_TUPVAL => "upvalue",
        LUA_TPROTO => "proto",
        _ => "no value",
    }
}

// ---- Handles ----

/// Handle to a collectable object: arena slot plus the slot generation it
/// was issued for. A handle to a freed slot never matches a reused one.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GcRef {
    index: u32,
    generation: u32,
}

impl GcRef {
    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        GcRef { index, generation }
    }

    #[inline]
    pub fn index(self) -> usize {
        self.index as usize
    }

    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for GcRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}@{}", self.index, self.generation)
    }
}

// ---- Marks ----

bitflags! {
    /// Collector color bits plus the "has a finalizer" flag.
    ///
    /// Gray is the absence of both white bits and the black bit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Marks: u8 {
        const WHITE0 = 1 << 3;
        const WHITE1 = 1 << 4;
        const BLACK = 1 << 5;
        /// Object is on the finalizer lists (`finobj` / `tobefnz`).
        const FINALIZED = 1 << 6;
    }
}

impl Marks {
    pub const WHITES: Marks = Marks::WHITE0.union(Marks::WHITE1);
    pub const COLORS: Marks = Marks::WHITES.union(Marks::BLACK);

    /// The white that is not `self` (which must be one of the two whites).
    #[inline]
    pub fn other_white(self) -> Marks {
        self.intersection(Marks::WHITES) ^ Marks::WHITES
    }
}

// ---- Ages ----

/// Generational age of an object.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Age {
    /// Created in the current cycle.
    New = 0,
    /// Survived one minor collection.
    Survival = 1,
    /// Marked old by a forward barrier in this cycle.
    Old0 = 2,
    /// First full cycle as old.
    Old1 = 3,
    /// Really old; not visited by minor collections.
    Old = 4,
    /// Old object modified in this cycle.
    Touched1 = 5,
    /// Old object modified in the previous cycle.
    Touched2 = 6,
}

impl Age {
    /// Anything past `Survival` counts as old.
    #[inline]
    pub fn is_old(self) -> bool {
        self > Age::Survival
    }

    /// Age after surviving a minor collection.
    pub fn next(self) -> Age {
        match self {
            Age::New => Age::Survival,
            Age::Survival => Age::Old1,
            Age::Old0 => Age::Old1,
            Age::Old1 => Age::Old,
            Age::Old => Age::Old,
            Age::Touched1 => Age::Touched1,
            Age::Touched2 => Age::Touched2,
        }
    }

    /// Young objects are the ones a minor collection sweeps.
    #[inline]
    pub fn is_young(self) -> bool {
        matches!(self, Age::New | Age::Survival | Age::Old0)
    }
}

/// Which collector list owns an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcList {
    /// Ordinary live set.
    AllGc,
    /// Objects with a registered finalizer.
    FinObj,
    /// Unreachable objects waiting for their finalizer to run.
    ToBeFnz,
    /// Permanent objects, never collected before teardown.
    Fixed,
}

/// Header carried by every collectable object.
#[derive(Debug, Clone, Copy)]
pub struct GcHeader {
    tt: u8,
    marks: Marks,
    age: Age,
    list: GcList,
}

impl GcHeader {
    /// Header for a fresh object painted with the current white.
    pub fn new(tt: u8, current_white: Marks) -> Self {
        GcHeader {
            tt,
            marks: current_white & Marks::WHITES,
            age: Age::New,
            list: GcList::AllGc,
        }
    }

    #[inline]
    pub fn tag(&self) -> u8 {
        self.tt
    }

    #[inline]
    pub fn marks(&self) -> Marks {
        self.marks
    }

    #[inline]
    pub fn is_white(&self) -> bool {
        self.marks.intersects(Marks::WHITES)
    }

    #[inline]
    pub fn is_black(&self) -> bool {
        self.marks.contains(Marks::BLACK)
    }

    #[inline]
    pub fn is_gray(&self) -> bool {
        !self.marks.intersects(Marks::COLORS)
    }

    /// Dead means painted with the white of the previous cycle.
    #[inline]
    pub fn is_dead(&self, current_white: Marks) -> bool {
        self.marks.intersects(current_white.other_white())
    }

    #[inline]
    pub fn set_gray(&mut self) {
        self.marks.remove(Marks::COLORS);
    }

    #[inline]
    pub fn set_black(&mut self) {
        self.marks.remove(Marks::COLORS);
        self.marks.insert(Marks::BLACK);
    }

    /// Paint with the current white, keeping the age.
    #[inline]
    pub fn make_white(&mut self, current_white: Marks) {
        self.marks.remove(Marks::COLORS);
        self.marks.insert(current_white & Marks::WHITES);
    }

    /// Paint with the current white and reset the age to `New`.
    #[inline]
    pub fn reset(&mut self, current_white: Marks) {
        self.make_white(current_white);
        self.age = Age::New;
    }

    /// Swap white shades (resurrects an object condemned in this cycle).
    #[inline]
    pub fn flip_white(&mut self) {
        self.marks.toggle(Marks::WHITES);
    }

    #[inline]
    pub fn age(&self) -> Age {
        self.age
    }

    #[inline]
    pub fn set_age(&mut self, age: Age) {
        self.age = age;
    }

    #[inline]
    pub fn change_age(&mut self, from: Age, to: Age) {
        debug_assert_eq!(self.age, from);
        self.age = to;
    }

    #[inline]
    pub fn is_old(&self) -> bool {
        self.age.is_old()
    }

    #[inline]
    pub fn to_finalize(&self) -> bool {
        self.marks.contains(Marks::FINALIZED)
    }

    #[inline]
    pub fn set_finalized(&mut self, on: bool) {
        self.marks.set(Marks::FINALIZED, on);
    }

    #[inline]
    pub fn list(&self) -> GcList {
        self.list
    }

    #[inline]
    pub fn set_list(&mut self, list: GcList) {
        self.list = list;
    }
}
