/// Returned by a relaxation to control how the relocation that follows it is processed. The TLS
/// sequences pair an address computation with a call to the TLS helper; once the pair is
/// rewritten as a whole, the call's own relocation must not be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationModifier {
    Normal,
    SkipNextRelocation,
}
