macro_rules! efrom {
    ($ename:ty, $vname:ident, $sname:ty) => {
        impl From<$sname> for $ename {
            fn from(e: $sname) -> Self {
                Self::$vname(Box::new(e))
            }
        }
    };
}

macro_rules! linear_ids {
    ($ids:ident, $id:ident) => {
        pub struct $ids {
            next: std::sync::atomic::AtomicU64,
        }

        impl $ids {
            #[allow(dead_code)]
            pub const fn new() -> Self {
                Self {
                    next: std::sync::atomic::AtomicU64::new(1),
                }
            }

            pub fn next(&self) -> $id {
                $id(self
                    .next
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed))
            }
        }

        impl Default for $ids {
            fn default() -> Self {
                Self::new()
            }
        }

        #[derive(Copy, Clone, Debug, Hash, Ord, PartialOrd, Eq, PartialEq)]
        pub struct $id(u64);

        #[allow(dead_code)]
        impl $id {
            pub fn raw(self) -> u64 {
                self.0
            }
        }

        impl std::fmt::Display for $id {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

macro_rules! bitflags {
    ($name:ident: $rep:ty; $($var:ident = $val:expr,)*) => {
        #[derive(Copy, Clone, Eq, PartialEq, Default, Hash)]
        pub struct $name(pub $rep);

        $(
            pub const $var: $name = $name($val);
        )*

        #[allow(dead_code)]
        impl $name {
            pub fn none() -> Self {
                Self(0)
            }

            pub fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn intersects(self, other: Self) -> bool {
                self.0 & other.0 != 0
            }

            pub fn is_none(self) -> bool {
                self.0 == 0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self::Output {
                Self(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let mut any = false;
                let mut rem = self.0;
                $(
                    if $val != 0 && self.0 & $val == $val {
                        if any {
                            f.write_str("|")?;
                        }
                        any = true;
                        rem &= !$val;
                        f.write_str(stringify!($var))?;
                    }
                )*
                if rem != 0 || !any {
                    if any {
                        f.write_str("|")?;
                    }
                    write!(f, "0x{:x}", rem)?;
                }
                Ok(())
            }
        }
    };
}
